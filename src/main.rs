extern crate log;
pub mod choropleth;
pub mod crs;
pub mod error;
pub mod geofile;
pub mod narrate;
pub mod session;
#[cfg(test)]
mod test_utils;

use crate::choropleth::category::Category;
use crate::choropleth::render::RenderSettings;
use crate::choropleth::thresholds::ThresholdSet;
use crate::error::MapError;
use crate::narrate::narration::{NarrationConfig, Narrator, API_KEY_ENV_VAR};
use crate::session::{Event, Session};
use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::{fs::read_to_string, path::Path};
use tempfile::TempDir;

/// Classify regions of a zipped shapefile by value and render them as a choropleth map.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the attribute columns of a zipped shapefile.
    Columns {
        /// Path to the zip archive containing the shapefile.
        #[arg(short, long)]
        archive: PathBuf,
        /// Directory for the extracted files.
        #[arg(short, long, default_value_os_t = default_data_dir())]
        data_dir: PathBuf,
    },
    /// Write a metrics table with every region's label set to 0, ready to edit and paste into a config.
    Template {
        #[arg(short, long)]
        archive: PathBuf,
        /// Column whose values identify the regions.
        #[arg(short, long)]
        label_column: String,
        /// Output YAML file, stdout if not given.
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(short, long, default_value_os_t = default_data_dir())]
        data_dir: PathBuf,
    },
    /// Render the map described by a config file.
    Render {
        /// Path to the input config file.
        #[arg(short, long)]
        config_filepath: String,
        /// Send the rendered map to the inference service and print its analysis.
        #[arg(short, long)]
        narrate: bool,
    },
}

fn default_data_dir() -> PathBuf {
    std::env::temp_dir().join("choropleth_rust")
}

#[derive(Deserialize, Debug)]
struct Config {
    archive_path: PathBuf,
    data_dir: PathBuf,
    label_column: Option<String>,
    title: Option<String>,
    #[serde(default)]
    thresholds: ThresholdSet,
    /// Metric per region, keyed by the label column's value.
    #[serde(default)]
    metrics: HashMap<String, f64>,
    #[serde(default)]
    render: RenderSettings,
    #[serde(default)]
    narration: NarrationConfig,
    #[serde(default)]
    export_geojson: bool,
}

impl Config {
    fn events(&self, archive_bytes: Vec<u8>) -> Vec<Event> {
        let archive_name = self
            .archive_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut events = vec![Event::UploadArchive {
            name: archive_name,
            bytes: archive_bytes,
        }];
        if let Some(label_column) = &self.label_column {
            events.push(Event::SelectLabelColumn(label_column.clone()));
        }
        events.push(Event::SetThresholds(self.thresholds));
        events.push(Event::SetTitle(self.title.clone()));
        if !self.metrics.is_empty() {
            events.push(Event::SetMetricsByLabel(self.metrics.clone()));
        }
        events
    }
}

fn load_config(config_filepath: &str) -> anyhow::Result<Config> {
    if !Path::new(config_filepath).exists() {
        return Err(anyhow!("Config file {} not found", config_filepath));
    }
    let config_contents = read_to_string(config_filepath)?;
    let config: Config = serde_yaml::from_str(&config_contents)?;
    Ok(config)
}

fn upload_event(archive: &Path) -> anyhow::Result<Event> {
    let bytes = std::fs::read(archive).with_context(|| format!("Reading archive {:?}", archive))?;
    let name = archive
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    Ok(Event::UploadArchive { name, bytes })
}

/// Upload into a scratch workspace below `data_dir`. The workspace is deleted when the returned
/// `TempDir` is dropped.
fn upload_to_scratch(archive: &Path, data_dir: &Path) -> anyhow::Result<(TempDir, Session)> {
    std::fs::create_dir_all(data_dir)?;
    let scratch = tempfile::Builder::new()
        .prefix("scratch-")
        .tempdir_in(data_dir)
        .with_context(|| format!("Creating scratch workspace in {:?}", data_dir))?;
    let session = Session::new(scratch.path())?.apply(upload_event(archive)?)?;
    Ok((scratch, session))
}

/// Workspace of the `render` command: one per config file, reused by every run of that config.
fn render_workspace(config_filepath: &str, data_dir: &Path) -> PathBuf {
    let name = Path::new(config_filepath)
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "map".to_string());
    data_dir.join(name)
}

fn list_columns(archive: &Path, data_dir: &Path) -> anyhow::Result<()> {
    let (_scratch, session) = upload_to_scratch(archive, data_dir)?;
    let dataset = session.dataset().ok_or_else(|| anyhow!("No dataset read"))?;
    println!("{} features", dataset.len());
    for column in dataset.columns() {
        println!("{}", column);
    }
    Ok(())
}

fn write_metrics_template(
    archive: &Path,
    label_column: &str,
    output: Option<&Path>,
    data_dir: &Path,
) -> anyhow::Result<()> {
    let (_scratch, session) = upload_to_scratch(archive, data_dir)?;
    let dataset = session.dataset().ok_or_else(|| anyhow!("No dataset read"))?;
    let mut metrics = serde_yaml::Mapping::new();
    for label in dataset.labels(label_column)? {
        metrics.insert(label.into(), 0.into());
    }
    let mut template = serde_yaml::Mapping::new();
    template.insert("label_column".into(), label_column.into());
    template.insert("metrics".into(), metrics.into());
    let contents = serde_yaml::to_string(&template)?;
    match output {
        Some(output) => {
            std::fs::write(output, contents)?;
            log::info!("Wrote metrics template to {:?}", output);
        }
        None => print!("{}", contents),
    }
    Ok(())
}

fn render_from_config(config_filepath: &str, narrate: bool) -> anyhow::Result<()> {
    let config = load_config(config_filepath)?;
    // Checked before rendering so a missing credential is reported up front.
    let narrator = Narrator::from_env(config.narration.clone());
    if narrate && !narrator.is_available() {
        log::warn!(
            "{}",
            MapError::MissingCredential {
                variable: API_KEY_ENV_VAR.to_string()
            }
        );
    }

    let archive_bytes = std::fs::read(&config.archive_path)
        .with_context(|| format!("Reading archive {:?}", config.archive_path))?;
    let workspace = render_workspace(config_filepath, &config.data_dir);
    let session = Session::open(&workspace)?.apply_all(config.events(archive_bytes))?;
    log::info!(
        "Classifying in {:?} with {:?}",
        session.workspace(),
        session.thresholds()
    );

    let rendered = session.render(&config.render)?;
    for category in Category::ALL {
        let count = rendered
            .plan
            .regions
            .iter()
            .filter(|region| region.category == category)
            .count();
        log::info!("{} regions are {}", count, category);
    }
    log::debug!(
        "Map image is {}x{} pixels",
        rendered.image.width(),
        rendered.image.height()
    );
    println!("{}", rendered.path.display());

    if config.export_geojson {
        let export_path = session.export()?;
        log::info!("Wrote classified regions to {:?}", export_path);
    }

    if narrate && narrator.is_available() {
        match narrator.narrate(&rendered.path) {
            Ok(analysis) => println!("{}", analysis),
            // Narration failures do not invalidate the rendered map.
            Err(err) => log::error!("{:?}", err),
        }
    }
    Ok(())
}

fn try_main() -> anyhow::Result<()> {
    let args = Args::try_parse()?;
    match args.command {
        Command::Columns { archive, data_dir } => list_columns(&archive, &data_dir),
        Command::Template {
            archive,
            label_column,
            output,
            data_dir,
        } => write_metrics_template(&archive, &label_column, output.as_deref(), &data_dir),
        Command::Render {
            config_filepath,
            narrate,
        } => render_from_config(&config_filepath, narrate),
    }
}

fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    env_logger::init();
    if let Err(e) = try_main() {
        eprintln!("Error: {:?}", e);
        std::process::exit(error::exit_code(&e))
    }
}
