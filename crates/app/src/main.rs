// mic-bridge : diffuse le micro vers un ou plusieurs salons vocaux
//
// Commandes :
// - hosts   : liste les API audio hôtes
// - devices : liste les périphériques d'entrée d'une API
// - run     : capture, encode et diffuse vers les salons rejoints
// - listen  : récepteur de test qui compte les paquets reçus

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use audio::default_host_api;
use bridge::{BridgeConfig, ControllerHandle, ControllerStatus, PipelineController};
use network::{utils, ChannelTarget, JoinOutcome, PacketSink, SinkStats, UdpVoiceTransport};

#[derive(Parser)]
#[command(author, version, about = "Pont micro → salons vocaux")]
struct Cli {
    /// Journalisation détaillée (RUST_LOG reste prioritaire)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Liste les API audio hôtes
    Hosts,
    /// Liste les périphériques d'entrée
    Devices {
        /// API hôte (défaut : celle du système)
        #[arg(long)]
        host_api: Option<String>,
    },
    /// Capture le micro et diffuse vers les salons
    Run {
        /// Fichier de configuration TOML
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(long)]
        host_api: Option<String>,
        #[arg(short, long)]
        device: Option<String>,
        /// Salon à rejoindre au démarrage, au format NOM=IP:PORT (répétable)
        #[arg(short, long = "join")]
        join: Vec<String>,
        /// Débit Opus en kbps (borné à [12, 512])
        #[arg(short, long)]
        bitrate: Option<u32>,
        /// Démarre en sourdine
        #[arg(long)]
        muted: bool,
        /// Port UDP local
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Reçoit les paquets d'un pont et affiche les compteurs
    Listen {
        #[arg(short, long, default_value = "9001")]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Hosts => show_hosts(),
        Commands::Devices { host_api } => show_devices(host_api),
        Commands::Run { config, host_api, device, join, bitrate, muted, port } => {
            let mut config = match config {
                Some(path) => BridgeConfig::load(&path)
                    .with_context(|| format!("Chargement de {}", path.display()))?,
                None => BridgeConfig::default(),
            };

            // La ligne de commande l'emporte sur le fichier
            if host_api.is_some() {
                config.host_api = host_api;
            }
            if device.is_some() {
                config.device = device;
            }
            if let Some(kbps) = bitrate {
                config.audio.bitrate_kbps = kbps;
            }
            if let Some(port) = port {
                config.network.local_port = port;
            }
            config.start_muted |= muted;
            for spec in &join {
                config.channels.push(utils::parse_target(spec)?);
            }
            config.validate()?;

            run_bridge(config).await?
        }
        Commands::Listen { port } => run_listener(port).await?,
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with_target(false)
        .init();
}

fn show_hosts() {
    let default = default_host_api();
    println!("🔊 API audio disponibles :");
    for host in PipelineController::list_host_apis() {
        let marker = if host == default { '*' } else { ' ' };
        println!("   {} {}", marker, host);
    }
}

fn show_devices(host_api: Option<String>) {
    let host_api = host_api.unwrap_or_else(default_host_api);
    let devices = PipelineController::list_input_devices(&host_api);

    if devices.is_empty() {
        println!("❌ Aucun périphérique d'entrée pour {}", host_api);
        return;
    }

    println!("🎤 Périphériques d'entrée ({}) :", host_api);
    for device in devices {
        println!("   {}", device);
    }
}

async fn run_bridge(config: BridgeConfig) -> anyhow::Result<()> {
    let transport = Arc::new(UdpVoiceTransport::bind(config.network.clone()).await?);
    info!(addr = ?transport.local_addr(), "Transport UDP prêt");

    let mut controller = PipelineController::from_config(&config, transport)?;

    let device = controller.start_default_recording(config.host_api.as_deref(), config.device.as_deref())?;
    println!("🎤 Capture : {} ({})", device.name, device.host_api);

    for target in config.channels.iter().cloned() {
        let name = target.to_string();
        match controller.join(target).await {
            Ok(_) => println!("✅ Salon rejoint : {}", name),
            Err(e) => println!("❌ {} : {}", name, e),
        }
    }

    let handle = controller.handle();
    tokio::spawn(read_commands(handle.clone()));
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Écoute de Ctrl+C impossible");
            return;
        }
        println!("\n🛑 Arrêt demandé");
        handle.stop();
    });

    controller.run().await?;

    let failures = controller.shutdown().await;
    for failure in &failures {
        println!("⚠️  {}", failure);
    }
    println!("📊 {}", controller.stats());
    println!("👋 Pont arrêté");
    Ok(())
}

/// Lit les commandes interactives sur l'entrée standard
async fn read_commands(handle: ControllerHandle) {
    print_help();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("Entrée standard fermée");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Lecture de l'entrée standard impossible");
                return;
            }
        };

        match execute(&handle, line.trim()).await {
            Ok(true) => {}
            Ok(false) => {
                handle.stop();
                return;
            }
            Err(e) => println!("❌ {:#}", e),
        }
    }
}

/// Exécute une commande ; retourne `false` pour quitter
async fn execute(handle: &ControllerHandle, line: &str) -> anyhow::Result<bool> {
    let mut words = line.split_whitespace();

    match (words.next(), words.next(), words.next()) {
        (None, ..) => {}
        (Some("mute"), None, _) => {
            handle.set_muted(true).await?;
            println!("🔇 Sourdine");
        }
        (Some("unmute"), None, _) => {
            handle.set_muted(false).await?;
            println!("🔊 Micro actif");
        }
        (Some("bitrate"), Some(kbps), None) => {
            let applied = handle.set_bitrate(kbps.parse().context("bitrate attendu en kbps")?).await?;
            println!("🎚️  Bitrate : {} kbps", applied);
        }
        (Some("fec"), Some(value @ ("on" | "off")), None) => {
            handle.set_fec(value == "on").await?;
            println!("🛡️  FEC : {}", value);
        }
        (Some("loss"), Some(percent), None) => {
            let percent: u32 = percent.parse().context("pourcentage attendu")?;
            let percent = percent.min(100) as u8;
            handle.set_expected_loss(percent).await?;
            println!("📉 Perte attendue : {}%", percent);
        }
        (Some("join"), Some(name), Some(addr)) => {
            let target = ChannelTarget::new(name, utils::parse_address(addr)?);
            match handle.join(target.clone()).await? {
                JoinOutcome::Joined => println!("✅ Salon rejoint : {}", target),
                JoinOutcome::AlreadyJoined => println!("ℹ️  Déjà dans {}", target),
            }
        }
        (Some("leave"), Some(name), None) => {
            let report = handle.leave(name).await?;
            if !report.removed {
                println!("ℹ️  Salon {} non rejoint", name);
            } else {
                println!("👋 Salon quitté : {}", name);
                for failure in report.failures {
                    println!("⚠️  {}", failure);
                }
            }
        }
        (Some("status"), None, _) => print_status(&handle.status().await?),
        (Some("help"), ..) => print_help(),
        (Some("quit" | "q"), ..) => return Ok(false),
        _ => println!("❓ Commande inconnue : {} (help pour l'aide)", line),
    }

    Ok(true)
}

fn print_help() {
    println!("\n📋 Commandes :");
    println!("   mute | unmute");
    println!("   bitrate KBPS");
    println!("   fec on|off");
    println!("   loss POURCENT");
    println!("   join NOM IP:PORT");
    println!("   leave NOM");
    println!("   status");
    println!("   quit");
}

fn print_status(status: &ControllerStatus) {
    println!("\n📊 État du pont :");
    match &status.recording {
        Some(device) => println!("   Capture : {} ({})", device.name, device.host_api),
        None => println!("   Capture : aucune"),
    }
    println!("   Sourdine : {}", if status.muted { "oui" } else { "non" });
    println!("   Bitrate : {} kbps", status.bitrate_kbps);

    if status.channels.is_empty() {
        println!("   Salons : aucun");
    } else {
        println!("   Salons :");
        for channel in &status.channels {
            println!("     • {}", channel);
        }
    }
    println!("   {}", status.stats);
    println!("   Diffusion : {:.1}% des frames capturées", status.stats.transmit_ratio());
}

/// Lance un récepteur et affiche ses compteurs jusqu'à Ctrl+C
async fn run_listener(port: u16) -> anyhow::Result<()> {
    let sink = PacketSink::bind(port).await?;
    println!("🚀 Récepteur en écoute sur {}", sink.local_addr()?);
    println!("   Arrêt : Ctrl+C");

    let mut stats = sink.subscribe();
    let mut receiver = tokio::spawn(sink.run());
    let mut ticker = tokio::time::interval(Duration::from_secs(2));

    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                println!("\n🛑 Arrêt du récepteur");
                break;
            }
            result = &mut receiver => {
                result.context("Tâche de réception interrompue")??;
                break;
            }
            _ = ticker.tick() => {
                if stats.has_changed().unwrap_or(false) {
                    print_sink_stats(&stats.borrow_and_update());
                }
            }
        }
    }

    receiver.abort();
    Ok(())
}

fn print_sink_stats(stats: &SinkStats) {
    let mut sessions: Vec<_> = stats.sessions.iter().collect();
    sessions.sort_by_key(|(id, _)| **id);

    println!("\n📥 {} paquet(s) audio reçu(s)", stats.total_audio_packets());
    for (id, session) in sessions {
        let peer = session.peer.map(|p| p.to_string()).unwrap_or_default();
        let state = if session.closed {
            "fermée"
        } else if session.state.is_speaking() {
            "parle"
        } else {
            "silence"
        };
        println!(
            "   #{:<10} {:<21} {:>6} paquets  {:>10}  {}",
            id,
            peer,
            session.audio_packets,
            utils::format_bytes(session.audio_bytes),
            state
        );
    }
    if stats.invalid_packets > 0 {
        println!("   ⚠️  {} paquet(s) invalide(s)", stats.invalid_packets);
    }
}
