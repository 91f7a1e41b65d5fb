//! ログ出力の初期化
//!
//! `RUST_LOG` が設定されていればそれを優先し、無ければ `info`（`--verbose` 時は `debug`）。

use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// ログ設定
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// debugレベルまで出す
    pub verbose: bool,
    /// モジュールパスを表示する
    pub include_target: bool,
}

impl LogConfig {
    pub fn verbose() -> Self {
        Self {
            verbose: true,
            include_target: true,
        }
    }

    fn default_directive(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else {
            "info"
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.default_directive()))
    }
}

/// グローバルなsubscriberを設定する（2回目以降はエラー）
pub fn init_logging(config: &LogConfig) -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(config.filter())
        .with_target(config.include_target)
        .with_thread_ids(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}
