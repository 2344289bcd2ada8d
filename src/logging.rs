//! ログ出力の初期化

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// `RUST_LOG` 未設定時のフィルタ
pub const DEFAULT_FILTER: &str = "info";

/// fmt サブスクライバを登録する
///
/// `RUST_LOG` が設定されていればそちらを優先します。二重に呼んでも失敗しません。
pub fn init() {
    init_with(DEFAULT_FILTER);
}

/// 既定のフィルタを指定して登録する
pub fn init_with(default_filter: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .try_init();
}
