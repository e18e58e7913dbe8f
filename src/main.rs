use clap::{Arg, Command};
use imap_spamfilter::config::ConfigWatcher;
use imap_spamfilter::{
    Classifier, Config, FactExtractor, LocalConnector, MailMessage, MessageVerdicts,
    ReputationResolver, RuleEvaluator, Spamfilter, StateFile,
};
use log::LevelFilter;
use std::process;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    let matches = Command::new("imap-spamfilter")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Rule based spam filter for mailboxes")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/imap-spamfilter.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Test configuration validity")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test-email")
                .long("test-email")
                .value_name("FILE")
                .help("Classify a single RFC 822 file without executing any action")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("once")
                .long("once")
                .help("Process all accounts once and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("forget-processed")
                .long("forget-processed")
                .help("Forget processed messages before every pass")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    let config_path = matches
        .get_one::<String>("config")
        .cloned()
        .unwrap_or_default();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let mut watcher = ConfigWatcher::new(&config_path);
    let config = match watcher.reload_if_changed() {
        Ok(Some(config)) => {
            watcher.mark_applied();
            config
        }
        Ok(None) => {
            eprintln!("Error loading configuration: {config_path} was not read");
            process::exit(1);
        }
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        println!("Configuration is valid: {config_path}");
        for account in &config.accounts {
            println!(
                "Account '{}' ({}): {} rules",
                account.name,
                account.mailbox_path,
                account.rules.len()
            );
            for (i, rule) in account.rules.iter().enumerate() {
                println!("  Rule {}: {}", i + 1, rule.name);
            }
        }
        return;
    }

    if let Some(email_file) = matches.get_one::<String>("test-email") {
        if let Err(e) = test_email_file(&config, email_file).await {
            eprintln!("Error testing email: {e:#}");
            process::exit(1);
        }
        return;
    }

    config.log_options();
    let state_file = config.state_file.clone();
    let state = match &state_file {
        Some(path) => match StateFile::load(path) {
            Ok(state) => state,
            Err(e) => {
                log::error!("{e:#}");
                process::exit(1);
            }
        },
        None => StateFile::default(),
    };

    let mut spamfilter = Spamfilter::new(config, Box::new(LocalConnector));
    spamfilter.set_state(state);
    if let Err(e) = spamfilter.initialize().await {
        log::error!("Failed to initialize blocklist resolver: {e}");
        process::exit(1);
    }

    let forget_processed = matches.get_flag("forget-processed");

    if matches.get_flag("once") {
        run_pass(&mut spamfilter, forget_processed).await;
        save_state(&spamfilter);
        return;
    }

    run_loop(&mut spamfilter, &mut watcher, forget_processed).await;
    save_state(&spamfilter);
    log::info!("Shutting down");
}

async fn run_loop(spamfilter: &mut Spamfilter, watcher: &mut ConfigWatcher, forget: bool) {
    #[cfg(unix)]
    let (mut forget_signal, mut reinit_signal) = {
        use tokio::signal::unix::{signal, SignalKind};
        match (
            signal(SignalKind::user_defined1()),
            signal(SignalKind::hangup()),
        ) {
            (Ok(usr1), Ok(hup)) => (usr1, hup),
            (Err(e), _) | (_, Err(e)) => {
                log::error!("Failed to install signal handlers: {e}");
                return;
            }
        }
    };

    loop {
        run_pass(spamfilter, forget).await;

        let minutes = spamfilter.config().check_interval_minutes;
        let interval = Duration::from_secs(minutes.saturating_mul(60));
        log::debug!("Next check in {} minutes", interval.as_secs() / 60);

        #[cfg(unix)]
        {
            let sleep = tokio::time::sleep(interval);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    _ = tokio::signal::ctrl_c() => return,
                    _ = forget_signal.recv() => spamfilter.forget_processed_messages(),
                    _ = reinit_signal.recv() => {
                        log::info!("Reinitializing blocklist resolver");
                        if let Err(e) = spamfilter.reinitialize_resolver().await {
                            log::error!("Failed to reinitialize blocklist resolver: {e}");
                        }
                    }
                }
            }
        }

        #[cfg(not(unix))]
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => return,
        }

        match watcher.reload_if_changed() {
            Ok(Some(config)) => match spamfilter.apply_config(config).await {
                Ok(()) => watcher.mark_applied(),
                Err(e) => log::error!("Failed to apply new configuration: {e}"),
            },
            Ok(None) => {}
            Err(e) => log::error!("Keeping previous configuration: {e:#}"),
        }
    }
}

async fn run_pass(spamfilter: &mut Spamfilter, forget: bool) {
    if forget {
        spamfilter.forget_processed_messages();
    }
    let summary = spamfilter.process_all_accounts().await;
    log::debug!(
        "Checked {} messages in {} accounts, {} matched a rule",
        summary.messages,
        summary.accounts,
        summary.matched
    );
    if !summary.failed_accounts.is_empty() {
        log::warn!("Failed accounts: {}", summary.failed_accounts.join(", "));
    }
}

fn save_state(spamfilter: &Spamfilter) {
    if let Some(path) = &spamfilter.config().state_file {
        if let Err(e) = spamfilter.state().save(path) {
            log::error!("{e:#}");
        }
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

async fn test_email_file(config: &Config, email_file: &str) -> anyhow::Result<()> {
    let raw = std::fs::read(email_file)?;
    let message = MailMessage::parse(&raw, email_file);
    let facts = FactExtractor::extract(&message);

    println!("Testing email file: {email_file}");
    println!("{}", facts.summary());
    println!("Source addresses: {:?}", facts.ip_addresses);

    let resolver = Arc::new(ReputationResolver::new(config.reputation.clone()));
    resolver.load_configured_feeds().await?;
    resolver.initialize().await?;

    let classifier = Arc::new(Classifier::new(resolver));
    let general = &config.general_spamfilter_settings;
    let classification = classifier.classify_facts(&facts, Some(general)).await?;
    if classification.is_spam {
        println!("Result: SPAM ({})", classification.reason);
    } else {
        println!("Result: not spam");
    }

    let Some(account) = config.accounts.first() else {
        return Ok(());
    };
    let evaluator = RuleEvaluator::new(classifier);
    let mut verdicts = MessageVerdicts::new();
    println!("Rules of account '{}':", account.name);
    for rule in &account.rules {
        let outcome = evaluator
            .evaluate(rule, &facts, Some(general), &mut verdicts)
            .await?;
        if outcome.matched {
            let actions: Vec<&str> = rule.actions.iter().map(|a| a.name()).collect();
            println!(
                "  MATCH {}: {} -> {}",
                rule.name,
                outcome.reason,
                actions.join(", ")
            );
            if rule.stop_after_action && !rule.actions.is_empty() {
                break;
            }
        } else {
            println!("  no match {}", rule.name);
        }
    }
    Ok(())
}
