use std::process;

use app::Application;
use engine_core::config::{self, AppConfig, FlagOverrides};
use engine_core::log::{self, Level};
use opts::{Command, Opts};

mod app;
mod opts;

#[tokio::main]
async fn main() {
    let opts = Opts::from_args();

    // the core surfaces errors only; this is the one place that turns them
    // into exit codes
    let code = match run(opts).await {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(error) => {
            eprintln!("engine-ci failed - {:#}", error);
            1
        }
    };
    process::exit(code);
}

async fn run(opts: Opts) -> engine_core::Result<bool> {
    let flags = FlagOverrides {
        environment: opts.env.as_deref().map(str::parse).transpose()?,
        registry: opts.registry.clone(),
        runtime: opts.runtime.as_deref().map(str::parse).transpose()?,
        log_level: level_flag(&opts),
        no_color: opts.no_color.then_some(true),
        pull_policy: None,
    };

    let app_config = AppConfig::load(opts.config.as_deref(), &flags)?;
    app_config.validate()?;
    setup_logging(&opts, &app_config)?;
    config::set(app_config);

    match opts.command {
        Command::Build(build_opts) => {
            let snapshot = config::snapshot();
            let application = Application::new(&snapshot, &opts)?;
            application.build(build_opts).await
        }
        Command::Config => {
            app::show_config()?;
            Ok(true)
        }
    }
}

fn level_flag(opts: &Opts) -> Option<String> {
    if opts.trace {
        Some("debug".to_string())
    } else if opts.debug {
        Some("debug".to_string())
    } else if opts.quiet {
        Some("warn".to_string())
    } else {
        None
    }
}

fn setup_logging(opts: &Opts, config: &AppConfig) -> engine_core::Result<()> {
    let level = if opts.trace {
        Level::Trace
    } else {
        match config.logging.level.as_str() {
            "debug" => Level::Debug,
            "warn" => Level::Warn,
            "error" => Level::Error,
            _ => Level::Info,
        }
    };

    let log_config = match opts.log_file.as_ref().or(config.logging.file.as_ref()) {
        Some(path) => log::Config::file(path),
        None => log::Config::stdout(),
    };
    log_config
        .level(level)
        .no_color(opts.no_color || config.logging.no_color)
        .install()?;
    Ok(())
}
