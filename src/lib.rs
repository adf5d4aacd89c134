pub mod error;
pub mod models;
pub mod trainers;

// Re-export common types
pub use error::TrainError;
pub use trainers::{load_config, train_from_config, Config, Hps, ProcessConfig, RunOverrides, TrainOutcome};

pub mod logging {
    use env_logger::{Builder, Env};
    use std::io::Write;

    /// Timestamped logger on stderr. Defaults to `info`; `RUST_LOG` overrides.
    pub fn init_logger() {
        Builder::from_env(Env::default().default_filter_or("info"))
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .init();
    }
}
