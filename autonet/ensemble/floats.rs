//! JSON encoding for floats and float arrays that keeps NaN and infinities.
//!
//! Finite values are plain JSON numbers. Non-finite values become the strings `"NaN"`,
//! `"inf"` and `"-inf"`. A JSON `null` reads back as NaN.

use std::fmt;

use ndarray::Array2;
use serde::{
    de::{self, Visitor},
    Deserialize, Deserializer, Serialize, Serializer,
};

const NAN: &str = "NaN";
const INF: &str = "inf";
const NEG_INF: &str = "-inf";

struct JsonFloat(f64);

impl Serialize for JsonFloat {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let value = self.0;
        if value.is_finite() {
            serializer.serialize_f64(value)
        } else if value.is_nan() {
            serializer.serialize_str(NAN)
        } else if value > 0.0 {
            serializer.serialize_str(INF)
        } else {
            serializer.serialize_str(NEG_INF)
        }
    }
}

impl<'de> Deserialize<'de> for JsonFloat {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(JsonFloatVisitor)
    }
}

struct JsonFloatVisitor;

impl Visitor<'_> for JsonFloatVisitor {
    type Value = JsonFloat;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a number, null, or one of \"NaN\", \"inf\", \"-inf\"")
    }

    fn visit_f64<E: de::Error>(self, value: f64) -> Result<JsonFloat, E> {
        Ok(JsonFloat(value))
    }

    #[allow(clippy::cast_precision_loss)]
    fn visit_i64<E: de::Error>(self, value: i64) -> Result<JsonFloat, E> {
        Ok(JsonFloat(value as f64))
    }

    #[allow(clippy::cast_precision_loss)]
    fn visit_u64<E: de::Error>(self, value: u64) -> Result<JsonFloat, E> {
        Ok(JsonFloat(value as f64))
    }

    fn visit_unit<E: de::Error>(self) -> Result<JsonFloat, E> {
        Ok(JsonFloat(f64::NAN))
    }

    fn visit_none<E: de::Error>(self) -> Result<JsonFloat, E> {
        Ok(JsonFloat(f64::NAN))
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<JsonFloat, E> {
        match value {
            NAN => Ok(JsonFloat(f64::NAN)),
            INF => Ok(JsonFloat(f64::INFINITY)),
            NEG_INF => Ok(JsonFloat(f64::NEG_INFINITY)),
            other => Err(E::invalid_value(de::Unexpected::Str(other), &self)),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct EncodedArray {
    shape: (usize, usize),
    data: Vec<JsonFloat>,
}

impl EncodedArray {
    fn encode(array: &Array2<f64>) -> Self {
        Self {
            shape: array.dim(),
            data: array.iter().map(|value| JsonFloat(*value)).collect(),
        }
    }

    fn decode<E: de::Error>(self) -> Result<Array2<f64>, E> {
        let data = self.data.into_iter().map(|value| value.0).collect();
        Array2::from_shape_vec(self.shape, data).map_err(E::custom)
    }
}

/// `#[serde(with)]` module for a single `f64`.
pub mod value {
    use super::{Deserialize, Deserializer, JsonFloat, Serialize, Serializer};

    /// Serializes `value`, writing non-finite values as strings.
    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        JsonFloat(*value).serialize(serializer)
    }

    /// Reads a number, `null` or one of the non-finite strings.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        JsonFloat::deserialize(deserializer).map(|value| value.0)
    }
}

/// `#[serde(with)]` module for a two-dimensional array.
pub mod array {
    use super::{Array2, Deserialize, Deserializer, EncodedArray, Serialize, Serializer};

    /// Serializes `array` as its shape plus row-major data.
    pub fn serialize<S: Serializer>(array: &Array2<f64>, serializer: S) -> Result<S::Ok, S::Error> {
        EncodedArray::encode(array).serialize(serializer)
    }

    /// Reads an array written by [`serialize`].
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Array2<f64>, D::Error> {
        EncodedArray::deserialize(deserializer)?.decode()
    }
}

/// `#[serde(with)]` module for a list of fold arrays.
pub mod folds {
    use super::{Array2, Deserialize, Deserializer, EncodedArray, Serialize, Serializer};

    /// Serializes every fold.
    pub fn serialize<S: Serializer>(
        folds: &[Array2<f64>],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        folds
            .iter()
            .map(EncodedArray::encode)
            .collect::<Vec<_>>()
            .serialize(serializer)
    }

    /// Reads folds written by [`serialize`].
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Array2<f64>>, D::Error> {
        Vec::<EncodedArray>::deserialize(deserializer)?
            .into_iter()
            .map(EncodedArray::decode)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Scored {
        #[serde(with = "super::value")]
        score: f64,
        #[serde(with = "super::array")]
        predictions: Array2<f64>,
    }

    #[test]
    fn non_finite_values_are_written_as_strings() {
        let scored = Scored {
            score: f64::NAN,
            predictions: array![[0.25, f64::INFINITY], [f64::NEG_INFINITY, 1.0]],
        };
        let encoded = serde_json::to_value(&scored).unwrap();
        assert_eq!(encoded["score"], json!("NaN"));
        assert_eq!(encoded["predictions"]["shape"], json!([2, 2]));
        assert_eq!(encoded["predictions"]["data"], json!([0.25, "inf", "-inf", 1.0]));

        let decoded: Scored = serde_json::from_value(encoded).unwrap();
        assert!(decoded.score.is_nan());
        assert!(decoded.predictions[[0, 1]].is_infinite() && decoded.predictions[[0, 1]] > 0.0);
        assert!(decoded.predictions[[1, 0]].is_infinite() && decoded.predictions[[1, 0]] < 0.0);
    }

    #[test]
    fn null_and_integers_are_accepted() {
        let decoded: Scored = serde_json::from_str(
            r#"{"score":null,"predictions":{"shape":[1,2],"data":[1,null]}}"#,
        )
        .unwrap();
        assert!(decoded.score.is_nan());
        assert!((decoded.predictions[[0, 0]] - 1.0).abs() < f64::EPSILON);
        assert!(decoded.predictions[[0, 1]].is_nan());
    }

    #[test]
    fn unknown_strings_and_bad_shapes_are_rejected() {
        assert!(serde_json::from_str::<Scored>(
            r#"{"score":"big","predictions":{"shape":[1,1],"data":[1.0]}}"#
        )
        .is_err());
        assert!(serde_json::from_str::<Scored>(
            r#"{"score":1.0,"predictions":{"shape":[2,2],"data":[1.0]}}"#
        )
        .is_err());
    }
}
