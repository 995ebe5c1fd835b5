use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProjectionError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProjectionError {
    /// Rejected before any path is simulated.
    #[error("invalid configuration for `{field}`: {message}")]
    Configuration { field: String, message: String },

    #[error("insufficient price history for {asset}: need at least {required} observations, got {available}")]
    InsufficientData {
        asset: String,
        required: usize,
        available: usize,
    },

    #[error("price data unavailable for {asset}: {reason}")]
    AssetUnavailable { asset: String, reason: String },

    /// A simulated value left the finite range; the whole run is aborted.
    #[error("non-finite {field} ({value}) on path {path} at month {month}")]
    Numerical {
        path: usize,
        month: usize,
        field: String,
        value: f64,
    },
}

impl ProjectionError {
    pub fn configuration(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn insufficient_data(asset: impl Into<String>, required: usize, available: usize) -> Self {
        Self::InsufficientData {
            asset: asset.into(),
            required,
            available,
        }
    }

    pub fn asset_unavailable(asset: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::AssetUnavailable {
            asset: asset.into(),
            reason: reason.into(),
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    /// True for both flavours of missing or short market data.
    pub fn is_insufficient_data(&self) -> bool {
        matches!(
            self,
            Self::InsufficientData { .. } | Self::AssetUnavailable { .. }
        )
    }
}
