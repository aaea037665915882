use std::{fmt::Display, str::FromStr};

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Error;

/// Weight dtype of a model configuration.
///
/// Parsed from the fixed table `float16`, `float`, `float32`, `bfloat16`. Any other string is
/// rejected with [`Error::UnsupportedDType`] rather than resolving to nothing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelDType {
    #[serde(rename = "float16")]
    F16,
    #[serde(rename = "float32", alias = "float")]
    F32,
    #[default]
    #[serde(rename = "bfloat16")]
    BF16,
}

impl ModelDType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::F16 => "float16",
            Self::F32 => "float32",
            Self::BF16 => "bfloat16",
        }
    }

    /// The dtype to build weights in on `device`.
    ///
    /// The CPU backend has no bf16 matmul, so `bfloat16` falls back to `float32` there.
    pub fn for_device(&self, device: &Device) -> DType {
        let dtype = match self {
            Self::BF16 if device.is_cpu() => {
                warn!("bfloat16 matmul is unavailable on the CPU, using float32 instead.");
                DType::F32
            }
            other => DType::from(*other),
        };
        info!("DType selected is {dtype:?}.");
        dtype
    }
}

impl Display for ModelDType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ModelDType {
    type Err = Error;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "float16" => Ok(Self::F16),
            "float" | "float32" => Ok(Self::F32),
            "bfloat16" => Ok(Self::BF16),
            other => Err(Error::UnsupportedDType(other.to_string())),
        }
    }
}

impl From<ModelDType> for DType {
    fn from(value: ModelDType) -> Self {
        match value {
            ModelDType::F16 => DType::F16,
            ModelDType::F32 => DType::F32,
            ModelDType::BF16 => DType::BF16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_dtype_table() {
        assert_eq!("float16".parse::<ModelDType>().unwrap(), ModelDType::F16);
        assert_eq!("float".parse::<ModelDType>().unwrap(), ModelDType::F32);
        assert_eq!("float32".parse::<ModelDType>().unwrap(), ModelDType::F32);
        assert_eq!("bfloat16".parse::<ModelDType>().unwrap(), ModelDType::BF16);
        assert_eq!(DType::from(ModelDType::BF16), DType::BF16);
        assert_eq!(DType::from(ModelDType::F32), DType::F32);
    }

    #[test]
    fn rejects_unknown_dtype() {
        let err = "int8".parse::<ModelDType>().unwrap_err();
        assert!(matches!(err, Error::UnsupportedDType(ref s) if s == "int8"));
        assert!(err.to_string().contains("`int8`"));
        // The table is case-sensitive.
        assert!("BFLOAT16".parse::<ModelDType>().is_err());
    }

    #[test]
    fn bfloat16_falls_back_on_cpu() {
        let cpu = Device::Cpu;
        assert_eq!(ModelDType::BF16.for_device(&cpu), DType::F32);
        assert_eq!(ModelDType::F16.for_device(&cpu), DType::F16);
        assert_eq!(ModelDType::F32.for_device(&cpu), DType::F32);
    }

    #[test]
    fn serde_uses_table_names() {
        assert_eq!(
            serde_json::to_string(&ModelDType::BF16).unwrap(),
            "\"bfloat16\""
        );
        let dtype: ModelDType = serde_json::from_str("\"float\"").unwrap();
        assert_eq!(dtype, ModelDType::F32);
        assert_eq!(ModelDType::F16.to_string(), "float16");
    }
}
