use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::types::Modality;

/// Linear maps between embedding spaces, keyed by `<from>_to_<to>`.
///
/// A query can only be searched against another modality's index when a
/// projection between the two spaces is registered. Matching dimensions
/// alone do not make two embedding spaces comparable.
#[derive(Default)]
pub struct ProjectionRegistry {
    matrices: HashMap<(Modality, Modality), Matrix>,
}

/// Row-major matrix: `rows[i]` has one weight per source dimension.
#[derive(Deserialize)]
struct Matrix(Vec<Vec<f32>>);

impl Matrix {
    fn validate(&self, from_dim: usize) -> Result<()> {
        for row in &self.0 {
            if row.len() != from_dim {
                return Err(Error::DimensionMismatch {
                    expected: from_dim,
                    actual: row.len(),
                });
            }
        }
        Ok(())
    }

    fn apply(&self, vector: &[f32]) -> Vec<f32> {
        self.0
            .iter()
            .map(|row| row.iter().zip(vector.iter()).map(|(w, x)| w * x).sum())
            .collect()
    }
}

impl ProjectionRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load projection matrices from a JSON file shaped like
    /// `{"text_to_image": [[...], ...], "image_to_text": [[...], ...]}`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let raw: HashMap<String, Matrix> = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("invalid projection file: {}", e)))?;

        let mut matrices = HashMap::new();
        for (key, matrix) in raw {
            let pair = match key.as_str() {
                "text_to_image" => (Modality::Text, Modality::Image),
                "image_to_text" => (Modality::Image, Modality::Text),
                other => {
                    return Err(Error::Config(format!("unknown projection key: {}", other)));
                }
            };
            matrices.insert(pair, matrix);
        }

        Ok(Self { matrices })
    }

    /// Map `vector` from one embedding space into another.
    ///
    /// Same modality passes through untouched. Any other pair requires a
    /// registered matrix, even when the two dimensions happen to match.
    pub fn project(
        &self,
        from: Modality,
        to: Modality,
        vector: &[f32],
        to_dim: usize,
    ) -> Result<Vec<f32>> {
        if from == to {
            return Ok(vector.to_vec());
        }

        if let Some(matrix) = self.matrices.get(&(from, to)) {
            matrix.validate(vector.len())?;
            let projected = matrix.apply(vector);
            if projected.len() != to_dim {
                return Err(Error::DimensionMismatch {
                    expected: to_dim,
                    actual: projected.len(),
                });
            }
            return Ok(projected);
        }

        Err(Error::IncompatibleModality(format!(
            "no projection from {} ({}d) to {} ({}d)",
            from,
            vector.len(),
            to,
            to_dim
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_modality_is_identity() {
        let registry = ProjectionRegistry::empty();
        let v = vec![1.0, 2.0, 3.0];
        let out = registry
            .project(Modality::Text, Modality::Text, &v, 3)
            .unwrap();
        assert_eq!(out, v);
    }

    #[test]
    fn test_equal_dims_without_matrix_are_still_incompatible() {
        // Two models can share a width while their spaces stay unrelated.
        let registry = ProjectionRegistry::empty();
        let err = registry
            .project(Modality::Text, Modality::Image, &[0.5, 0.5], 2)
            .unwrap_err();
        assert!(matches!(err, Error::IncompatibleModality(_)));
    }

    #[test]
    fn test_unequal_dims_without_matrix_are_incompatible() {
        let registry = ProjectionRegistry::empty();
        let v = vec![0.5, 0.5, 0.5];
        let err = registry
            .project(Modality::Text, Modality::Image, &v, 2)
            .unwrap_err();
        assert!(matches!(err, Error::IncompatibleModality(_)));
    }

    #[test]
    fn test_matrix_projection() {
        let mut registry = ProjectionRegistry::empty();
        // 2x3 matrix mapping a 3d text space into a 2d image space.
        registry.matrices.insert(
            (Modality::Text, Modality::Image),
            Matrix(vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 1.0]]),
        );

        let out = registry
            .project(Modality::Text, Modality::Image, &[2.0, 3.0, 4.0], 2)
            .unwrap();
        assert_eq!(out, vec![2.0, 7.0]);
    }
}
