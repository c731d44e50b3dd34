//! A small logistic-regression scoring model.

use std::collections::BTreeMap;

use schemars::JsonSchema;

use super::{ScoringModel, features::PdfFeatures};
use crate::{async_utils::io::read_json_or_toml, prelude::*};

/// A logistic-regression model over named [`PdfFeatures`].
///
/// Model files may be JSON or TOML:
///
/// ```toml
/// bias = 1.0
///
/// [weights]
/// log_chars_per_page = -1.2
/// textless_page_ratio = 2.5
/// ```
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LogisticModel {
    /// Intercept.
    pub bias: f64,
    /// Weight for each feature, keyed by name.
    pub weights: BTreeMap<String, f64>,
}

impl Default for LogisticModel {
    /// Built-in weights. Text-heavy pages push the score down. Empty pages,
    /// scanned images and undecodable text push it up.
    fn default() -> Self {
        let weights = [
            ("log_chars_per_page", -1.2),
            ("textless_page_ratio", 2.5),
            ("garbled_char_ratio", 4.0),
            ("images_per_page", 0.8),
            ("fonts_per_page", -0.3),
            ("is_form", -0.5),
            ("is_encrypted", 1.0),
        ];
        Self {
            bias: 1.0,
            weights: weights
                .into_iter()
                .map(|(name, weight)| (name.to_owned(), weight))
                .collect(),
        }
    }
}

impl LogisticModel {
    /// Load a model file.
    pub async fn load(path: &Path) -> Result<Self> {
        let model: Self = read_json_or_toml(path).await?;
        model
            .validate()
            .with_context(|| format!("invalid model in {}", path.display()))?;
        Ok(model)
    }

    /// Check that every weight names a known feature.
    pub fn validate(&self) -> Result<()> {
        for (name, weight) in &self.weights {
            if !PdfFeatures::NAMES.contains(&name.as_str()) {
                return Err(anyhow!(
                    "unknown feature {:?} (expected one of {})",
                    name,
                    PdfFeatures::NAMES.join(", ")
                ));
            }
            if !weight.is_finite() {
                return Err(anyhow!("weight for {:?} is not finite", name));
            }
        }
        if !self.bias.is_finite() {
            return Err(anyhow!("bias is not finite"));
        }
        Ok(())
    }
}

impl ScoringModel for LogisticModel {
    fn predict(&self, features: &PdfFeatures) -> Result<f64> {
        let mut logit = self.bias;
        for (name, weight) in &self.weights {
            let value = features
                .get(name)
                .ok_or_else(|| anyhow!("unknown feature {:?}", name))?;
            logit += weight * value;
        }
        Ok(1.0 / (1.0 + (-logit).exp()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(chars_per_page: f64, textless: f64, images: f64) -> PdfFeatures {
        PdfFeatures {
            num_pages: 1,
            sampled_pages: 1,
            chars_per_page,
            textless_page_ratio: textless,
            images_per_page: images,
            fonts_per_page: 1.0,
            ..PdfFeatures::default()
        }
    }

    #[test]
    fn default_model_separates_text_from_scans() {
        let model = LogisticModel::default();
        model.validate().unwrap();
        let text = model.predict(&features(1500.0, 0.0, 0.0)).unwrap();
        let scan = model.predict(&features(0.0, 1.0, 1.0)).unwrap();
        assert!(text < 0.1, "text score {text}");
        assert!(scan > 0.9, "scan score {scan}");
    }

    #[test]
    fn prediction_is_deterministic() {
        let model = LogisticModel::default();
        let f = features(42.0, 0.5, 2.0);
        assert_eq!(model.predict(&f).unwrap(), model.predict(&f).unwrap());
    }

    #[tokio::test]
    async fn loads_toml_model_and_rejects_unknown_features() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("model.toml");
        std::fs::write(&good, "bias = -2.0\n\n[weights]\ntextless_page_ratio = 4.0\n")
            .unwrap();
        let model = LogisticModel::load(&good).await.unwrap();
        assert_eq!(model.bias, -2.0);

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, r#"{"bias": 0.0, "weights": {"color": 1.0}}"#).unwrap();
        let err = LogisticModel::load(&bad).await.unwrap_err();
        assert!(format!("{err:#}").contains("unknown feature"));
    }
}
