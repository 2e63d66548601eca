use anyhow::Context;

pub(crate) struct Args {
    pub rtsp_url: String,
    pub config_path: Option<String>,
    pub status_interval: u64,
    pub force_h264: bool,
    pub use_relay: bool,
    pub log_level: String,
}

pub(crate) fn parse_args() -> anyhow::Result<Args> {
    let mut rtsp_url = None;
    let mut config_path = None;
    let mut status_interval: u64 = 20;
    let mut force_h264 = false;
    let mut use_relay = false;
    let mut log_level = "info".to_string();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => {
                println!("camera-bridge {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                println!("camera-bridge - per-camera RTSP-to-WebRTC bridge");
                println!();
                println!("USAGE:");
                println!("    camera-bridge --rtsp-url <URL> [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    --rtsp-url <URL>       Source RTSP/V4L2/URI to pull from (required)");
                println!("    --config <PATH>        Path to a YAML config overlay");
                println!(
                    "    --status <SECONDS>     Status heartbeat interval [default: 20]"
                );
                println!("    --no-status            Disable the status heartbeat");
                println!("    --force-h264           Reject offers that don't support H.264");
                println!(
                    "    --use-relay            Fan out frames via the relay track instead of the non-buffered track"
                );
                println!("    --log-level <LEVEL>    Log level [default: info]");
                println!("    -V, --version          Print version and exit");
                println!("    -h, --help             Print this help and exit");
                std::process::exit(0);
            }
            "--rtsp-url" => {
                i += 1;
                rtsp_url = Some(args.get(i).context("Missing --rtsp-url value")?.clone());
            }
            "--config" => {
                i += 1;
                config_path = Some(args.get(i).context("Missing --config value")?.clone());
            }
            "--status" => {
                i += 1;
                status_interval = args
                    .get(i)
                    .context("Missing --status value")?
                    .parse()
                    .context("Invalid --status value")?;
            }
            "--no-status" => {
                status_interval = 0;
            }
            "--force-h264" => {
                force_h264 = true;
            }
            "--use-relay" => {
                use_relay = true;
            }
            "--log-level" => {
                i += 1;
                log_level = args.get(i).context("Missing --log-level value")?.clone();
            }
            other => anyhow::bail!("Unknown argument: {other}"),
        }
        i += 1;
    }

    Ok(Args {
        rtsp_url: rtsp_url.context("--rtsp-url is required")?,
        config_path,
        status_interval,
        force_h264,
        use_relay,
        log_level,
    })
}
