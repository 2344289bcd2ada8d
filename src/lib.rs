//! 眼底画像の疾患分類
//!
//! 畳み込みニューラルネットワークの学習と、1枚ずつの推論を提供します。

pub mod backend;
pub mod error;
pub mod logging;
pub mod ml;
pub mod model;
pub mod server;

pub use error::{Error, Result};
