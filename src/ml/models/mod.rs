//! Model family implementations

pub mod attention;
pub mod multivariate;
pub mod recurrent;
pub mod univariate;

pub use attention::{AttentionModel, AttentionWeights, EncoderLayerWeights, LayerNormWeights};
pub use multivariate::{MultivariateModel, VarWeights};
pub use recurrent::{RecurrentModel, RecurrentWeights};
pub use univariate::{ArComponentWeights, UnivariateModel, UnivariateWeights};
