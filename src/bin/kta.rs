//! KTA CLI — administration and demo driver for the Key Trust Agent
//!
//! Commands:
//!   kta init    — bootstrap the trust anchor from key/certificate files
//!   kta hash    — register TA images as trusted measurements
//!   kta status  — show cache, queue and attestation counters
//!   kta serve   — run the key agent against an in-memory KCM
//!   kta reset   — erase all persisted KTA state
//!   kta demo    — walk through a full TA → KTA → KA → KCM exchange

use kta_core::config::KtaConfig;
use kta_core::kta::agent::STATE_RECORD;
use kta_core::kta::{KeyLookup, KeyTrustAgent, KtaError};
use kta_core::relay::{InMemoryKcm, KeyAgent, LocalTee, RelayConfig};
use kta_core::tee::{MemoryStorage, SealedFileStorage, SecureStorage, TaMeasurement};
use std::env;
use tokio::sync::watch;
use uuid::Uuid;

const CONFIG_ENV: &str = "KTA_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "kta-config.json";

fn print_usage() {
    println!(
        r#"
KTA v0.1 — Key Trust Agent

Usage: kta <command> [options]

Commands:
  init    <kcm-pub> <kta-cert> <kta-key>   Bootstrap from key/certificate files
  hash    <ta-image>...                    Register TA images as trusted
  status                                   Show KTA state
  serve   [interval-ms]                    Poll the KTA against an in-memory KCM
  reset                                    Erase all persisted KTA state
  demo                                     Run an in-memory end-to-end demo

Configuration is read from ${} (default {}).
"#,
        CONFIG_ENV, DEFAULT_CONFIG_FILE
    );
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return;
    }

    let result = match args[1].as_str() {
        "init" => cmd_init(&args[2..]),
        "hash" => cmd_hash(&args[2..]),
        "status" => cmd_status(),
        "serve" => cmd_serve(&args[2..]).await,
        "reset" => cmd_reset(),
        "demo" => cmd_demo(),
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("  Error: {} (0x{:08X})", e, e.code());
        std::process::exit(1);
    }
}

fn load_config() -> Result<KtaConfig, KtaError> {
    let path = env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
    KtaConfig::load_or_default(&path).map_err(|e| KtaError::BadParameters(e.to_string()))
}

/// Open the persistent KTA behind an in-process endpoint
fn open_tee() -> Result<LocalTee<SealedFileStorage>, KtaError> {
    let config = load_config()?;
    let storage = SealedFileStorage::open(&config.storage_dir, &config.device_secret)?;
    Ok(LocalTee::new(KeyTrustAgent::open(config, storage)?))
}

fn read_file(path: &str) -> Result<Vec<u8>, KtaError> {
    std::fs::read(path).map_err(|e| KtaError::BadParameters(format!("{}: {}", path, e)))
}

fn cmd_init(args: &[String]) -> Result<(), KtaError> {
    if args.len() < 3 {
        eprintln!("Usage: kta init <kcm-pub> <kta-cert> <kta-key>");
        return Ok(());
    }
    let kcm_pub = read_file(&args[0])?;
    let cert = read_file(&args[1])?;
    let key = read_file(&args[2])?;

    let mut agent = KeyAgent::new(open_tee()?, InMemoryKcm::new(), RelayConfig::default());
    let echoed = agent.bootstrap(&kcm_pub, &cert, &key)?;
    println!("\n  KTA initialized");
    println!("  Certificate:     {} bytes", echoed.len());
    Ok(())
}

fn cmd_hash(args: &[String]) -> Result<(), KtaError> {
    if args.is_empty() {
        eprintln!("Usage: kta hash <ta-image>...");
        return Ok(());
    }
    let mut measurements = Vec::with_capacity(args.len());
    for path in args {
        let m = TaMeasurement::compute(&read_file(path)?);
        println!("  {}  {}", m, path);
        measurements.push(m);
    }
    let agent = KeyAgent::new(open_tee()?, InMemoryKcm::new(), RelayConfig::default());
    agent.register_ta_hashes(&measurements)?;
    println!("  Registered {} measurements", measurements.len());
    Ok(())
}

fn cmd_status() -> Result<(), KtaError> {
    let tee = open_tee()?;
    let status = tee.with_agent(|kta| kta.status())?;

    println!("\n  KTA Status");
    println!("  {}", "=".repeat(40));
    println!("  Initialized:     {}", status.initialized);
    println!(
        "  Cache:           {} ready, {} pending, {} failed, {} deleted",
        status.cache.ready, status.cache.pending, status.cache.failed, status.cache.deleted
    );
    println!(
        "  Queue:           {}/{} ({} not yet delivered)",
        status.queue_depth, status.max_queue_depth, status.queued
    );
    println!("  Next sequence:   {}", status.next_sequence);
    println!("  Trusted hashes:  {}", status.trusted_measurements);
    Ok(())
}

async fn cmd_serve(args: &[String]) -> Result<(), KtaError> {
    let mut config = RelayConfig::default();
    if let Some(ms) = args.first().and_then(|s| s.parse().ok()) {
        config.poll_interval_ms = ms;
    }
    let agent = KeyAgent::new(open_tee()?, InMemoryKcm::new(), config);

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(agent.run(rx));
    println!("  Key agent running, press Ctrl-C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("  Failed to listen for Ctrl-C: {}", e);
    }
    let _ = tx.send(true);
    let agent = handle
        .await
        .map_err(|e| KtaError::GenericFailure(format!("agent task: {}", e)))?;
    println!("  Relayed {} commands", agent.kcm().handled());
    Ok(())
}

fn cmd_reset() -> Result<(), KtaError> {
    let agent = KeyAgent::new(open_tee()?, InMemoryKcm::new(), RelayConfig::default());
    agent.close_kta()?;
    println!("  KTA state erased");
    Ok(())
}

fn cmd_demo() -> Result<(), KtaError> {
    println!("\n  === KTA demo ===\n");

    let kta = KeyTrustAgent::open(KtaConfig::default(), MemoryStorage::new())?;
    let tee = LocalTee::new(kta);
    let mut agent = KeyAgent::new(tee.clone(), InMemoryKcm::new(), RelayConfig::default());

    println!("  [1] Bootstrap");
    let cert = agent.bootstrap(b"demo-kcm-public-key", b"demo-kta-certificate", b"demo-kta-key")?;
    println!("      KCM now holds {} certificate(s), {} bytes", agent.kcm().kta_certificates().len(), cert.len());

    println!("  [2] Register and attest a TA");
    let measurement = TaMeasurement::compute(b"demo-ta-image");
    agent.register_ta_hashes(&[measurement])?;
    let ta = Uuid::new_v4();
    tee.with_agent(|kta| kta.attest_ta(ta, measurement))??;
    println!("      TA {} verified ({})", ta, measurement);

    println!("  [3] TA looks up a key that is not cached");
    let lookup = tee.with_agent(|kta| kta.search_key(ta, "storage-key"))??;
    println!("      -> {}", describe(&lookup));

    println!("  [4] KA polls and relays to KCM");
    let report = agent.poll_once()?;
    println!(
        "      {} commands delivered in {} rounds, {} accepted",
        report.delivered, report.rounds, report.accepted
    );

    println!("  [5] TA retries");
    let lookup = tee.with_agent(|kta| kta.search_key(ta, "storage-key"))??;
    println!("      -> {}", describe(&lookup));

    println!("  [6] TA exits, its keys are destroyed");
    let destroyed = tee.with_agent(|kta| kta.ta_exit(ta))??;
    agent.poll_once()?;
    println!("      {} key(s) destroyed and revoked at KCM", destroyed);

    let status = tee.with_agent(|kta| kta.status())?;
    println!(
        "\n  Final: {} cache entries ready, queue depth {}, next sequence {}",
        status.cache.ready, status.queue_depth, status.next_sequence
    );
    print_storage_summary(&tee)?;
    Ok(())
}

fn describe(lookup: &KeyLookup) -> String {
    match lookup {
        KeyLookup::Ready(material) => format!("ready ({} bytes)", material.len()),
        KeyLookup::Pending { sequence } => format!("pending, retry later (seq {})", sequence),
        KeyLookup::Failed => "failed".to_string(),
    }
}

fn print_storage_summary<S: SecureStorage>(tee: &LocalTee<S>) -> Result<(), KtaError> {
    let snapshot = tee.with_agent(|kta| kta.storage().load(STATE_RECORD))??;
    println!(
        "  Persisted snapshot: {} bytes",
        snapshot.map(|s| s.len()).unwrap_or(0)
    );
    Ok(())
}
