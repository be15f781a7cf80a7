//! Vector math helpers. All distances in this workspace are cosine over
//! L2-normalized vectors, so similarity is a plain dot product.

/// Normalize in place to unit length. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Dot product. For unit vectors this is cosine similarity in [-1, 1].
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Cosine similarity for unit vectors, clamped to [0, 1] — negative
/// similarity carries no signal for our retrieval use cases.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    dot(a, b).clamp(0.0, 1.0)
}

/// Cosine distance for unit vectors.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - dot(a, b)
}

/// Encode as little-endian f32 bytes for BLOB storage.
pub fn to_blob(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for x in v {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

/// Decode a BLOB written by [`to_blob`]. Returns `None` if the byte length
/// is not a multiple of 4.
pub fn from_blob(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_makes_unit_length() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((dot(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn normalize_leaves_zero_vector() {
        let mut v = vec![0.0, 0.0, 0.0];
        l2_normalize(&mut v);
        assert_eq!(v, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn blob_round_trip() {
        let v = vec![0.25f32, -1.5, 3.125];
        assert_eq!(from_blob(&to_blob(&v)).unwrap(), v);
    }

    #[test]
    fn bad_blob_rejected() {
        assert!(from_blob(&[1, 2, 3]).is_none());
    }

    #[test]
    fn identical_vectors_have_zero_distance() {
        let mut v = vec![0.3, 0.9, 0.1];
        l2_normalize(&mut v);
        assert!(cosine_distance(&v, &v).abs() < 1e-6);
    }
}
