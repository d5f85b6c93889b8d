//! Log setup for the demo binary and the Python extension.
//!
//! The level comes from `AXON_LOG`, then `RUST_LOG`, defaulting to `info`.

use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

static RUST_LOG_ONCE: Once = Once::new();

fn env_level() -> LevelFilter {
    std::env::var("AXON_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(parse_level)
        .unwrap_or(LevelFilter::Info)
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

fn parse_level(input: &str) -> Option<LevelFilter> {
    input.trim().parse::<LevelFilter>().ok()
}

/// Install the stderr logger. Later calls are no-ops.
pub fn init_rust_logging() {
    let level = env_level();
    RUST_LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(level_to_str(level));
        let _ = env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(false)
            .try_init();
    });
}

#[cfg(feature = "python")]
pub use python::{init_python_logging, set_python_log_level_str};

#[cfg(feature = "python")]
mod python {
    use std::collections::HashMap;
    use std::sync::{Mutex, Once};

    use log::{Level, LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use pyo3::prelude::*;
    use pyo3::types::PyModule;

    use super::{env_level, parse_level};

    static PY_LOG_ONCE: Once = Once::new();
    static PY_LOGGER: OnceCell<&'static PyLogger> = OnceCell::new();

    /// Forwards `log` records to Python's `logging`, one Python logger per
    /// Rust target (`_core::serial` becomes `_core.serial`).
    struct PyLogger {
        top_filter: Mutex<LevelFilter>,
        logging_mod: Py<PyModule>,
        loggers: Mutex<HashMap<String, Py<PyAny>>>,
    }

    fn python_level(level: Level) -> u32 {
        match level {
            Level::Error => 40,
            Level::Warn => 30,
            Level::Info => 20,
            Level::Debug => 10,
            Level::Trace => 5,
        }
    }

    impl PyLogger {
        fn top(&self) -> LevelFilter {
            self.top_filter
                .lock()
                .map(|level| *level)
                .unwrap_or(LevelFilter::Off)
        }

        fn logger_for<'py>(&self, py: Python<'py>, target: &str) -> PyResult<Bound<'py, PyAny>> {
            if let Ok(loggers) = self.loggers.lock() {
                if let Some(logger) = loggers.get(target) {
                    return Ok(logger.bind(py).clone());
                }
            }
            let logger = self
                .logging_mod
                .bind(py)
                .call_method1("getLogger", (target,))?;
            if let Ok(mut loggers) = self.loggers.lock() {
                loggers.insert(target.to_string(), logger.clone().unbind());
            }
            Ok(logger)
        }

        fn forward(&self, record: &Record) {
            let target = record.target().replace("::", ".");
            let level = python_level(record.level());
            let message = record.args().to_string();
            Python::attach(|py| {
                let result = self.logger_for(py, &target).and_then(|logger| {
                    if logger.call_method1("isEnabledFor", (level,))?.is_truthy()? {
                        logger.call_method1("log", (level, message))?;
                    }
                    Ok(())
                });
                if let Err(e) = result {
                    e.restore(py);
                }
            });
        }
    }

    impl Log for PyLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level().to_level_filter() <= self.top()
        }

        fn log(&self, record: &Record) {
            if self.enabled(record.metadata()) {
                self.forward(record);
            }
        }

        fn flush(&self) {}
    }

    /// Route Rust logs into Python's `logging`. Later calls are no-ops.
    pub fn init_python_logging(py: Python<'_>) -> PyResult<()> {
        let level = env_level();
        let logging = py.import("logging")?;
        PY_LOG_ONCE.call_once(|| {
            let logger: &'static PyLogger = Box::leak(Box::new(PyLogger {
                top_filter: Mutex::new(level),
                logging_mod: logging.unbind(),
                loggers: Mutex::new(HashMap::new()),
            }));
            if log::set_logger(logger).is_ok() {
                log::set_max_level(level);
                let _ = PY_LOGGER.set(logger);
            }
        });
        Ok(())
    }

    /// Change the forwarded level at runtime; `None` re-reads the environment.
    pub fn set_python_log_level_str(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        init_python_logging(py)?;
        let level = level.and_then(parse_level).unwrap_or_else(env_level);
        if let Some(logger) = PY_LOGGER.get() {
            if let Ok(mut top) = logger.top_filter.lock() {
                *top = level;
            }
            if let Ok(mut loggers) = logger.loggers.lock() {
                loggers.clear();
            }
        }
        log::set_max_level(level);
        Ok(())
    }
}
