use clap::{ArgAction, Parser};
use std::path::PathBuf;
use tracing::level_filters::LevelFilter;

use crate::config::{defaults, RawOptions, UiMode};
use crate::logging::LogConfig;

#[derive(Parser, Debug)]
#[command(
    name = "tapline",
    version,
    about = "Intercepting HTTP(S) proxy with websocket transaction relay",
    disable_help_flag = true
)]
pub struct Cli {
    /// Log requests and responses
    #[arg(short, long)]
    pub log: bool,

    /// Host to listen on
    #[arg(short = 'h', long, default_value = defaults::HOST)]
    pub host: String,

    /// Port to listen on (0 picks a free port)
    #[arg(short, long, default_value_t = i64::from(defaults::PORT))]
    pub port: i64,

    /// Connect to a relay server and show its transactions instead of proxying
    #[arg(short = 'c', long, value_name = "WS_URL")]
    pub ws_client: Option<String>,

    /// Forward transactions to websocket clients
    #[arg(short = 's', long)]
    pub ws_server: bool,

    /// Websocket server host
    #[arg(long, default_value = defaults::WS_HOST)]
    pub ws_host: String,

    /// Websocket server port
    #[arg(long, default_value_t = i64::from(defaults::WS_PORT))]
    pub ws_port: i64,

    /// Open a viewer app attached to the websocket server [possible values: httpview]
    #[arg(long)]
    pub ws_app: Option<String>,

    /// Directory for the CA certificate and key [default: ~/.tapline/certs]
    #[arg(long)]
    pub certs_dir: Option<PathBuf>,

    /// Key length for issued certificates
    #[arg(long, default_value_t = i64::from(defaults::SERVER_KEY_LENGTH))]
    pub server_key_length: i64,

    /// The CA common name
    #[arg(long = "default-ca-common-name", default_value = defaults::CA_COMMON_NAME)]
    pub ca_common_name: String,

    /// User interface [possible values: none, terminal, text]
    #[arg(long)]
    pub ui: Option<String>,

    /// Shorthand for --ui terminal
    #[arg(short = 'b', long, conflicts_with = "ui")]
    pub blessed: bool,

    /// More diagnostics on stderr (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Write diagnostics to a daily rolling file in this directory
    /// [default with the terminal UI: ~/.tapline/logs]
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Print help
    #[arg(long, action = ArgAction::Help)]
    pub help: Option<bool>,
}

impl Cli {
    pub fn into_raw_options(self) -> RawOptions {
        let ui = self.ui_choice();
        RawOptions {
            log: self.log,
            host: self.host,
            port: self.port,
            ws_client: self.ws_client,
            ws_server: self.ws_server,
            ws_host: self.ws_host,
            ws_port: self.ws_port,
            ws_app: self.ws_app,
            certs_dir: self.certs_dir.unwrap_or_else(defaults::certs_dir),
            server_key_length: self.server_key_length,
            ca_common_name: self.ca_common_name,
            ui,
        }
    }

    fn ui_choice(&self) -> Option<String> {
        if self.blessed {
            Some(UiMode::Terminal.to_string())
        } else {
            self.ui.clone()
        }
    }

    fn wants_terminal_ui(&self) -> bool {
        self.ui_choice()
            .and_then(|ui| ui.trim().parse::<UiMode>().ok())
            == Some(UiMode::Terminal)
    }

    pub fn log_config(&self) -> LogConfig {
        let level = match self.verbose {
            0 => None,
            1 => Some(LevelFilter::DEBUG),
            _ => Some(LevelFilter::TRACE),
        };
        // The terminal UI draws on the alternate screen; stderr would tear it.
        let log_dir = match &self.log_dir {
            Some(dir) => Some(dir.clone()),
            None if self.wants_terminal_ui() => Some(defaults::log_dir()),
            None => None,
        };
        LogConfig { level, log_dir }
    }
}
