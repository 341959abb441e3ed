#![warn(clippy::unwrap_used, clippy::pedantic)]
#![allow(
    clippy::cast_lossless,
    clippy::cast_possible_truncation,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::module_name_repetitions,
    clippy::too_many_lines,
    clippy::doc_markdown
)]
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::Duration,
};

use color_eyre::eyre::{self, bail, OptionExt, WrapErr};
use fluent_templates::Loader;
use itertools::Itertools;
use kerbeng::{
    manager::{SimManager, DEFAULT_MIN_SIM_TIME},
    resources::ResourceLibrary,
    simulation::SimConditions,
    stage::Stage,
    vessel::VesselDescription,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use unic_langid::LanguageIdentifier;

fluent_templates::static_loader! {
    static LOCALES = {
        locales: "src/locales",
        fallback_language: "en-US",
        customise: |bundle| bundle.set_use_isolating(false),
    };
}

const US_ENGLISH: LanguageIdentifier = unic_langid::langid!("en-US");

macro_rules! i18n {
    ($v:expr) => {
        LOCALES.lookup(&US_ENGLISH, $v)
    };
}

macro_rules! i18n_args {
    ($v:expr, $($arg:expr => $val:expr),*) => {{
	let mut args = ::std::collections::HashMap::new();
	$(
	    args.insert(String::from($arg), ::fluent::FluentValue::from($val));
	)*
	LOCALES.lookup_with_args(&US_ENGLISH, $v, &args)
    }}
}

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
struct Settings {
    conditions: SimConditions,
    min_sim_time_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            conditions: SimConditions::default(),
            min_sim_time_ms: DEFAULT_MIN_SIM_TIME.as_millis() as u64,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct VesselFile {
    vessel: VesselDescription,
    /// Replaces the stock resource library when present.
    #[serde(default)]
    resources: Option<ResourceLibrary>,
}

#[derive(Debug, Default)]
struct Args {
    vessel: PathBuf,
    settings: Option<PathBuf>,
    ron: bool,
}

fn parse_args(args: impl Iterator<Item = String>) -> eyre::Result<Args> {
    let (flags, paths): (Vec<_>, Vec<_>) = args.partition(|x| x.starts_with("--"));
    let mut out = Args::default();
    for flag in flags {
        match flag.as_str() {
            "--ron" => out.ron = true,
            _ => bail!(i18n_args!("error-unknown-flag", "flag" => flag)),
        }
    }
    let mut paths = paths.into_iter().map(PathBuf::from);
    out.vessel = paths.next().ok_or_eyre(i18n!("usage"))?;
    out.settings = paths.next();
    if paths.next().is_some() {
        bail!(i18n!("usage"));
    }
    Ok(out)
}

fn read(path: &Path) -> eyre::Result<String> {
    fs::read_to_string(path)
        .wrap_err_with(|| i18n_args!("error-read-file", "path" => path.display().to_string()))
}

fn load_settings(path: Option<&Path>) -> eyre::Result<Settings> {
    let Some(path) = path else {
        debug!("no settings file, using defaults");
        return Ok(Settings::default());
    };
    toml::from_str(&read(path)?)
        .wrap_err_with(|| i18n_args!("error-parse-settings", "path" => path.display().to_string()))
}

fn load_vessel(path: &Path) -> eyre::Result<VesselFile> {
    ron::from_str(&read(path)?)
        .wrap_err_with(|| i18n_args!("error-parse-vessel", "path" => path.display().to_string()))
}

fn print_stages(vessel: &VesselDescription, stages: &[Stage]) {
    println!(
        "{}",
        i18n_args!("stages-title", "name" => vessel.name.clone(), "count" => stages.len())
    );
    for stage in stages.iter().rev() {
        println!("  {stage}");
    }
    let delta_v = stages.iter().map(|x| x.delta_v).sum::<f64>();
    let time = stages.iter().map(|x| x.time).sum::<f64>();
    println!(
        "{}",
        i18n_args!("stages-total", "dv" => format!("{delta_v:.1}"), "time" => format!("{time:.1}"))
    );

    let dry = stages
        .iter()
        .rev()
        .filter(|x| x.delta_v == 0.0 && x.thrust == 0.0)
        .map(|x| x.number)
        .join(", ");
    if !dry.is_empty() {
        println!("{}", i18n_args!("stages-no-thrust", "stages" => dry));
    }
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args = parse_args(std::env::args().skip(1))?;
    let settings = load_settings(args.settings.as_deref())?;
    let file = load_vessel(&args.vessel)?;
    info!(
        "loaded {} ({} parts) from {}",
        file.vessel.name,
        file.vessel.parts.len(),
        args.vessel.display()
    );

    let manager = SimManager::new(Duration::from_millis(settings.min_sim_time_ms));
    manager.set_conditions(settings.conditions);
    if let Some(resources) = file.resources {
        manager.set_resource_library(Arc::new(resources));
    }
    manager.set_on_ready(|| debug!("simulation results ready"));

    manager.request_simulation();
    while !manager.try_start_simulation(&file.vessel) {
        if let Some(message) = manager.fail_message() {
            error!("{message}");
            bail!(i18n_args!("error-simulation", "message" => message));
        }
        thread::sleep(POLL_INTERVAL);
    }
    manager.wait();

    let results = manager.results();
    if let Some(message) = results.fail_message {
        bail!(i18n_args!("error-simulation", "message" => message));
    }
    let stages = results
        .stages
        .ok_or_eyre(i18n!("error-no-results"))?;
    debug!("simulated {} stages in {:?}", stages.len(), results.run_time);

    if args.ron {
        println!(
            "{}",
            ron::ser::to_string_pretty(&*stages, ron::ser::PrettyConfig::default())?
        );
    } else {
        print_stages(&file.vessel, &stages);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(x: &[&str]) -> eyre::Result<Args> {
        parse_args(x.iter().map(|x| (*x).to_owned()))
    }

    #[test]
    fn parses_positional_paths_and_flags() {
        let parsed = args(&["rocket.ron", "--ron", "kerbin.toml"]).unwrap();
        assert_eq!(parsed.vessel, PathBuf::from("rocket.ron"));
        assert_eq!(parsed.settings, Some(PathBuf::from("kerbin.toml")));
        assert!(parsed.ron);

        assert!(args(&[]).is_err());
        assert!(args(&["a", "b", "c"]).is_err());
        assert!(args(&["a", "--bogus"]).is_err());
    }

    #[test]
    fn settings_fill_in_defaults() {
        let settings: Settings = toml::from_str(
            r"
            min_sim_time_ms = 50

            [conditions]
            atmosphere = 1.0
            ",
        )
        .unwrap();
        assert_eq!(settings.min_sim_time_ms, 50);
        assert_eq!(settings.conditions.atmosphere, 1.0);
        assert_eq!(settings.conditions.gravity, SimConditions::default().gravity);
    }

    #[test]
    fn demo_files_load() {
        let file = load_vessel(Path::new("demos/two_stage.ron")).unwrap();
        assert_eq!(file.vessel.parts.len(), 6);
        let settings = load_settings(Some(Path::new("demos/kerbin_sea_level.toml"))).unwrap();
        assert_eq!(settings.conditions.atmosphere, 1.0);
    }
}
