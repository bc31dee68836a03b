use qr_guard_common::config::Config;
use qr_guard_common::event::ScanEvent;
use qr_guard_scanner::console::{parse_input, Console, Input, HELP};
use qr_guard_scanner::decoder::{DecoderAdapter, RqrrDecoder};
use qr_guard_scanner::scan_loop::{Command, LoopSettings, ScanLoop};
use qr_guard_scanner::sink::ChannelSink;
use qr_guard_scanner::source::camera::MjpegCamera;
use qr_guard_scanner::source::upload::ImageUpload;
use qr_guard_scanner::verify::SafetyClient;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        mode = config.scan.mode,
        camera = config.camera.url,
        safety_api = config.safety_api.base_url,
        debounce_ms = config.scan.debounce_ms,
        "starting qr-guard scanner"
    );

    let verifier = match SafetyClient::new(&config.safety_api) {
        Ok(v) => v,
        Err(e) => {
            error!(error = %e, "failed to create safety API client");
            std::process::exit(1);
        }
    };

    let camera = match MjpegCamera::new(&config.camera) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to set up camera client");
            std::process::exit(1);
        }
    };

    let (sink, events) = ChannelSink::new();
    let mut scan_loop = ScanLoop::new(
        camera,
        DecoderAdapter::new(RqrrDecoder, config.scan.max_upload_dimension),
        verifier,
        sink,
        LoopSettings::from_config(&config.scan),
    );

    let (commands, rx) = mpsc::channel(16);
    let file_mode = config.scan.mode == "file";
    if file_mode {
        match &config.scan.file {
            Some(path) => queue_file(&commands, Path::new(path)).await,
            None => info!("file mode: type 'file <path>' to scan an image"),
        }
    } else {
        let _ = commands.send(Command::StartCamera).await;
    }
    println!("{HELP}");

    tokio::join!(scan_loop.run(rx), present(events, commands, file_mode));
}

async fn queue_file(commands: &mpsc::Sender<Command>, path: &Path) {
    match ImageUpload::from_path(path).await {
        Ok(upload) => {
            let _ = commands.send(Command::ScanFile(upload)).await;
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read upload");
            println!("Could not scan: {e}");
        }
    }
}

/// Render events and forward typed commands until the user quits.
///
/// In file mode with stdin closed, the first finished result ends the run.
async fn present(
    mut events: mpsc::UnboundedReceiver<ScanEvent>,
    commands: mpsc::Sender<Command>,
    exit_when_done: bool,
) {
    let mut console = Console::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut finished = false;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                finished = matches!(event, ScanEvent::Verdict { .. } | ScanEvent::Error { .. });
                if let Some(text) = console.show(event) {
                    print!("{text}");
                }
                if finished && exit_when_done && !stdin_open {
                    let _ = commands.send(Command::Shutdown).await;
                    break;
                }
            }
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => {
                        if !handle_input(&line, &mut console, &commands).await {
                            break;
                        }
                    }
                    Ok(None) => {
                        stdin_open = false;
                        if finished && exit_when_done {
                            let _ = commands.send(Command::Shutdown).await;
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "stdin read failed, ignoring further input");
                        stdin_open = false;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                let _ = commands.send(Command::Shutdown).await;
                break;
            }
        }
    }
}

/// Returns `false` once the session should end.
async fn handle_input(line: &str, console: &mut Console, commands: &mpsc::Sender<Command>) -> bool {
    let input = match parse_input(line) {
        Ok(i) => i,
        Err(msg) => {
            println!("{msg}");
            return true;
        }
    };

    let command = match input {
        Input::Camera => Command::StartCamera,
        Input::Stop => Command::Stop,
        Input::Restart => {
            console.dismiss();
            Command::Restart
        }
        Input::Retry => {
            console.clear_camera_error();
            Command::RetryCamera
        }
        Input::File(path) => {
            queue_file(commands, &path).await;
            return true;
        }
        Input::Dismiss => {
            console.dismiss();
            return true;
        }
        Input::Details => {
            match console.details() {
                Some(details) => println!("{details}"),
                None => println!("no verdict on screen"),
            }
            return true;
        }
        Input::Help => {
            println!("{HELP}");
            return true;
        }
        Input::Quit => {
            let _ = commands.send(Command::Shutdown).await;
            return false;
        }
    };
    commands.send(command).await.is_ok()
}
