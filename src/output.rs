use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, TimeZone};
use tracing::{error, info};

use crate::{
	extract::DiagramKind,
	types::{DeepChartError, RenderedImage},
	Result,
};

/// Writes rendered images into one output directory.
#[derive(Debug, Clone)]
pub struct OutputSink {
	dir: PathBuf,
}

impl OutputSink {
	/// Create the directory (and parents) if it does not exist yet.
	pub fn create(dir: impl Into<PathBuf>) -> Result<Self> {
		let dir = dir.into();
		std::fs::create_dir_all(&dir).map_err(|e| {
			error!("Failed to create output directory {}: {}", dir.display(), e);
			DeepChartError::Io(e)
		})?;

		Ok(Self { dir })
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	/// Write `image` as `<dir>/<name>.<ext>` and return the path.
	pub fn save(&self, name: &str, image: &RenderedImage) -> Result<PathBuf> {
		let path = self.dir.join(format!("{}.{}", name, image.format.extension()));
		std::fs::write(&path, &image.bytes).map_err(|e| {
			error!("Failed to write {}: {}", path.display(), e);
			DeepChartError::Io(e)
		})?;

		info!("Saved diagram to {}", path.display());

		Ok(path)
	}
}

/// `YYYYmmdd_HHMMSS_<kind>` for the current local time.
pub fn timestamped_name(kind: Option<DiagramKind>) -> String {
	name_at(&Local::now(), kind)
}

fn name_at<Tz: TimeZone>(at: &DateTime<Tz>, kind: Option<DiagramKind>) -> String
where
	Tz::Offset: std::fmt::Display,
{
	format!("{}_{}", at.format("%Y%m%d_%H%M%S"), kind.map_or("chart", |k| k.slug()))
}
