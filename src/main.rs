#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use field_map::config::{DataContext, MapConfiguration};
use field_map::constants::map::MAIN_MAP_ID;
use field_map::engine::{EngineLayer, HeadlessEngine, Pane};
use field_map::geolocation::{PositionError, SimulatedGeolocation};
use field_map::logging;
use field_map::page::{MapPage, PageInput, PageOptions};
use field_map::settings::{Control, SettingsStore, menu};
use field_map::storage::FileStorage;
use field_map::types::{LatLng, MapView, PositionSample};
use field_map::view_persistence::ViewPersistence;

#[derive(Parser)]
#[command(name = "field-map", version, about = "Inspect and drive the field map core headlessly")]
struct Cli {
    /// Map configuration file (defaults to the user config, then the built-in one)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Key-value storage file
    #[arg(long, global = true)]
    storage: Option<PathBuf>,
    /// Districts/features snapshot (JSON)
    #[arg(long, global = true)]
    data: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount the map and list the attached layers per pane
    Layers {
        #[arg(long, default_value = MAIN_MAP_ID)]
        map_id: String,
    },
    /// Show the settings menu with checked services
    Settings,
    /// Toggle a service within its group and save the result
    Toggle { group: String, service: String },
    /// Show the stored view of a map instance
    View {
        #[arg(long, default_value = MAIN_MAP_ID)]
        map_id: String,
    },
    /// Replay a scripted session against a mounted map
    Simulate { script: PathBuf },
}

/// A scripted session for `simulate`
#[derive(Debug, Deserialize)]
struct Script {
    #[serde(default)]
    data: Option<DataContext>,
    steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
enum Step {
    ToggleTracking,
    ResetTracking,
    Sample { lat: f64, lng: f64, accuracy: f64 },
    Failure { reason: FailureReason },
    Pan { lat: f64, lng: f64, zoom: u8 },
    ToggleService { group: String, service: String },
    ReturnHome,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
enum FailureReason {
    Denied,
    Timeout,
    Unavailable,
}

impl From<FailureReason> for PositionError {
    fn from(reason: FailureReason) -> Self {
        match reason {
            FailureReason::Denied => PositionError::PermissionDenied,
            FailureReason::Timeout => PositionError::Timeout,
            FailureReason::Unavailable => PositionError::PositionUnavailable("simulated".to_string()),
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<MapConfiguration> {
    match path {
        Some(path) => MapConfiguration::load_from(path),
        None => MapConfiguration::load(),
    }
}

fn load_data(path: Option<&Path>) -> Result<DataContext> {
    let Some(path) = path else {
        return Ok(DataContext::default());
    };
    let contents = fs::read_to_string(path).with_context(|| format!("Failed to read data snapshot from {:?}", path))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse data snapshot from {:?}", path))
}

fn describe(layer: &EngineLayer) -> String {
    match layer {
        EngineLayer::WmsTiles { url, layers, format, .. } => format!("wms {url} layers={layers} format={format}"),
        EngineLayer::CachedTiles { url, .. } => format!("tiles {url}"),
        EngineLayer::DynamicImage { url, format, .. } => format!("dynamic {url} format={format}"),
        EngineLayer::Geometry { geojson, .. } => {
            format!("geometry {}", geojson.get("type").and_then(|t| t.as_str()).unwrap_or("?"))
        }
        EngineLayer::MarkerGroup { markers, .. } => format!("markers x{}", markers.len()),
        EngineLayer::Marker(marker) => format!("marker {} at {:.5},{:.5}", marker.icon.url, marker.position.lat, marker.position.lng),
        EngineLayer::Circle { center, radius, .. } => format!("circle r={radius:.0}m at {:.5},{:.5}", center.lat, center.lng),
    }
}

type HeadlessPage = MapPage<HeadlessEngine, FileStorage, SimulatedGeolocation>;

async fn mount(config: MapConfiguration, storage: FileStorage, data: DataContext, map_id: String) -> Result<HeadlessPage> {
    let options = PageOptions {
        map_id,
        ..PageOptions::default()
    };
    let mut page = MapPage::mount(config, storage, SimulatedGeolocation::new(), options).await?;
    page.handle(PageInput::DataChanged(data)).await;
    Ok(page)
}

fn print_layers(page: &HeadlessPage) {
    for pane in [Pane::Basemap, Pane::Layer] {
        println!("{pane}:");
        for layer in page.host().engine().layers_in(pane) {
            println!("  {}", describe(layer));
        }
    }
    let free: Vec<_> = page
        .host()
        .engine()
        .layers()
        .filter(|(_, layer)| layer.pane().is_none())
        .collect();
    if !free.is_empty() {
        println!("overlay:");
        for (_, layer) in free {
            println!("  {}", describe(layer));
        }
    }
}

async fn simulate(config: MapConfiguration, storage: FileStorage, data: DataContext, script: &Path) -> Result<()> {
    let contents = fs::read_to_string(script).with_context(|| format!("Failed to read script {:?}", script))?;
    let script: Script = serde_json::from_str(&contents).with_context(|| format!("Failed to parse script {:?}", script))?;

    let mut page = mount(config, storage, script.data.unwrap_or(data), MAIN_MAP_ID.to_string()).await?;
    info!(steps = script.steps.len(), "Replaying script");

    for (index, step) in script.steps.into_iter().enumerate() {
        let label = format!("{step:?}");
        match step {
            Step::ToggleTracking => page.handle(PageInput::ToggleTracking).await,
            Step::ResetTracking => page.handle(PageInput::ResetTracking).await,
            Step::Sample { lat, lng, accuracy } => {
                if page.geolocation().emit(Ok(PositionSample::new(lat, lng, accuracy))) == 0 {
                    warn!(step = index, "No live watch, sample dropped");
                }
                page.settle().await;
            }
            Step::Failure { reason } => {
                page.geolocation().emit(Err(reason.into()));
                page.settle().await;
            }
            Step::Pan { lat, lng, zoom } => {
                page.engine_mut().user_move(MapView::new(LatLng::new(lat, lng), zoom));
                page.handle(PageInput::MapEvents).await;
            }
            Step::ToggleService { group, service } => {
                page.handle(PageInput::ToggleService {
                    group_id: group,
                    service_id: service,
                })
                .await;
            }
            Step::ReturnHome => page.handle(PageInput::ReturnHome).await,
        }

        let view = page
            .view()
            .map(|v| format!("{:.5},{:.5} z{}", v.center.lat, v.center.lng, v.zoom))
            .unwrap_or_default();
        println!("{:>3} {:<60} tracking={} view={} scale={}", index + 1, label, page.tracking(), view, page.scale().label);
        if let Some(e) = page.tracker().error() {
            println!("    error: {e}");
        }
    }

    print_layers(&page);
    page.unmount();
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    match logging::init(logging::level_from_env()) {
        Ok(Some(path)) => info!(path = %path.display(), "Writing debug log"),
        Ok(None) => {}
        Err(e) => eprintln!("Failed to initialize logging: {e:#}"),
    }

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let data = load_data(cli.data.as_deref())?;
    let storage = FileStorage::new(cli.storage.clone().unwrap_or_else(FileStorage::default_path));
    info!(storage = %storage.path().display(), "Using storage file");

    match cli.command {
        Commands::Layers { map_id } => {
            let page = mount(config, storage, data, map_id).await?;
            print_layers(&page);
            page.unmount();
        }
        Commands::Settings => {
            let mut store = SettingsStore::new();
            store.load(&storage, &config).await;
            let Some(settings) = store.settings() else {
                bail!("Map settings did not load");
            };
            for group in menu(&config, settings, &data) {
                println!("{} ({})", group.title, group.group_id);
                for item in group.items {
                    let mark = match (item.control, item.checked) {
                        (Control::Radio, true) => "(o)",
                        (Control::Radio, false) => "( )",
                        (Control::Checkbox, true) => "[x]",
                        (Control::Checkbox, false) => "[ ]",
                    };
                    println!("  {mark} {} - {}", item.service_id, item.title);
                }
            }
        }
        Commands::Toggle { group, service } => {
            if config.group(&group).is_none() {
                bail!("Unknown service group '{}'", group);
            }
            let mut store = SettingsStore::new();
            store.load(&storage, &config).await;
            if store.toggle(&group, &service, &config) {
                store.persist(&storage).await?;
            } else {
                println!("unchanged");
            }
            if let Some(settings) = store.settings() {
                println!("visible: {}", settings.visible_service_ids.join(", "));
            }
        }
        Commands::View { map_id } => {
            let persistence = ViewPersistence::new(&map_id);
            match persistence.read(&storage).await {
                Some(view) => println!(
                    "{}: {:.5},{:.5} zoom {}",
                    persistence.key(),
                    view.center.lat,
                    view.center.lng,
                    view.zoom
                ),
                None => println!("{}: no stored view", persistence.key()),
            }
        }
        Commands::Simulate { script } => simulate(config, storage, data, &script).await?,
    }

    Ok(())
}
