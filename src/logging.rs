use std::path::{Path, PathBuf};
use tracing::Dispatch;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Logging handle built once at startup and handed to the server. Nothing is
/// installed globally; the request loop runs under [`Logger::dispatch`].
#[derive(Clone)]
pub struct Logger {
	dispatch: Dispatch,
	log_file: Option<PathBuf>,
}

impl Logger {
	pub fn dispatch(&self) -> &Dispatch {
		&self.dispatch
	}
	pub fn log_file(&self) -> Option<&Path> {
		self.log_file.as_deref()
	}
}

/// Builds the append-only file sink `<log_dir>/<agent>.log` mirrored to
/// stderr. An unusable log directory degrades to stderr only.
pub fn init(agent: &str, log_dir: Option<&Path>) -> Logger {
	let appender = log_dir.and_then(|dir| open_appender(agent, dir));
	let log_file = match (&appender, log_dir) {
		(Some(_), Some(dir)) => Some(dir.join(format!("{}.log", agent))),
		_ => None,
	};
	let file_layer = appender.map(|appender| {
		fmt::layer()
			.with_writer(appender)
			.with_ansi(false)
			.with_target(false)
	});
	let stderr_layer = fmt::layer()
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.with_target(false);
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let subscriber = tracing_subscriber::registry()
		.with(filter)
		.with(file_layer)
		.with(stderr_layer);
	Logger {
		dispatch: Dispatch::new(subscriber),
		log_file
	}
}

fn open_appender(agent: &str, dir: &Path) -> Option<RollingFileAppender> {
	if let Err(err) = std::fs::create_dir_all(dir) {
		eprintln!("log directory {} unavailable ({}); logging to stderr only", dir.display(), err);
		return None;
	}
	match RollingFileAppender::builder()
		.rotation(Rotation::NEVER)
		.filename_prefix(agent)
		.filename_suffix("log")
		.build(dir) {
		Ok(appender) => Some(appender),
		Err(err) => {
			eprintln!("log file in {} unavailable ({}); logging to stderr only", dir.display(), err);
			None
		}
	}
}
