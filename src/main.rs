use clap::{Arg, ArgGroup, ArgMatches, Command};
use inbox_triage::auth::{RefreshingToken, TokenFile, TokenSource};
use inbox_triage::gmail::GmailSession;
use inbox_triage::{
    extract_address, Action, AuditLog, BatchError, BatchOptions, BatchProcessor, BatchReport,
    MailError, MatchType, RuleEngine, RuleStore, Settings, StoreError,
};
use log::LevelFilter;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const EXIT_REAUTHORIZE: i32 = 2;

fn cli() -> Command {
    Command::new("inbox-triage")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Rule-based inbox triage: archive, delete, spam or keep mail by sender")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Settings file (YAML)"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Write a settings file with default values")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("rules")
                .long("rules")
                .value_name("FILE")
                .help("Rule file path (overrides settings)"),
        )
        .arg(
            Arg::new("log-file")
                .long("log-file")
                .value_name("FILE")
                .help("Audit log path (overrides settings)"),
        )
        .arg(
            Arg::new("token")
                .long("token")
                .value_name("FILE")
                .help("Authorized token file (overrides settings)"),
        )
        .arg(
            Arg::new("list")
                .short('l')
                .long("list")
                .help("List rules in evaluation order")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("add")
                .long("add")
                .value_name("PATTERN")
                .help("Add a rule for an address, domain suffix or regex")
                .allow_hyphen_values(true),
        )
        .arg(
            Arg::new("edit")
                .long("edit")
                .value_name("ID")
                .help("Edit the rule with this id (or unique id prefix)"),
        )
        .arg(
            Arg::new("pattern")
                .long("pattern")
                .value_name("PATTERN")
                .help("New pattern when editing")
                .allow_hyphen_values(true),
        )
        .arg(
            Arg::new("match-type")
                .short('m')
                .long("match-type")
                .value_name("TYPE")
                .value_parser(["exact", "domain", "regex"])
                .help("How the pattern is matched against the sender"),
        )
        .arg(
            Arg::new("action")
                .short('a')
                .long("action")
                .value_name("ACTION")
                .value_parser(["keep", "delete", "archive", "move_to_spam"])
                .help("What to do with matching mail"),
        )
        .arg(
            Arg::new("delete")
                .long("delete")
                .value_name("ID")
                .num_args(1..)
                .help("Delete the rules with these ids"),
        )
        .arg(
            Arg::new("move")
                .long("move")
                .value_name("ID")
                .requires("to")
                .help("Move a rule to another position"),
        )
        .arg(
            Arg::new("to")
                .long("to")
                .value_name("POSITION")
                .value_parser(clap::value_parser!(usize))
                .help("Target position for --move (1 is evaluated first)"),
        )
        .arg(
            Arg::new("set-default")
                .long("set-default")
                .value_name("ACTION")
                .value_parser(["keep", "delete", "archive", "move_to_spam"])
                .help("Action for mail no rule matches"),
        )
        .arg(
            Arg::new("test-sender")
                .long("test-sender")
                .value_name("FROM")
                .help("Show which rule a From header or address would hit"),
        )
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .help("Log what would happen to each inbox message without changing anything")
                .action(clap::ArgAction::SetTrue)
                .conflicts_with("apply"),
        )
        .arg(
            Arg::new("apply")
                .long("apply")
                .help("Apply the rules to every inbox message")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("query")
                .short('q')
                .long("query")
                .value_name("QUERY")
                .help("Provider search query selecting the messages (default in:inbox)"),
        )
        .arg(
            Arg::new("limit")
                .long("limit")
                .value_name("N")
                .value_parser(clap::value_parser!(usize))
                .help("Process at most N messages"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .group(
            ArgGroup::new("command")
                .args([
                    "generate-config",
                    "list",
                    "add",
                    "edit",
                    "delete",
                    "move",
                    "set-default",
                    "test-sender",
                    "dry-run",
                    "apply",
                ])
                .multiple(false),
        )
}

fn main() {
    let matches = cli().get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let settings = match load_settings(&matches) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };
    let store = RuleStore::new(settings.rules_path.clone());

    if let Some(pattern) = matches.get_one::<String>("add") {
        let match_type = parse_arg::<MatchType>(&matches, "match-type").unwrap_or(MatchType::Exact);
        let action = parse_arg::<Action>(&matches, "action").unwrap_or(Action::Keep);
        match store.add_rule(pattern, match_type, action) {
            Ok(rule) => println!(
                "✅ Added rule {}: {} '{}' -> {}",
                rule.short_id(),
                rule.match_type,
                rule.pattern,
                rule.action
            ),
            Err(e) => exit_store_error(e),
        }
        return;
    }

    if let Some(id) = matches.get_one::<String>("edit") {
        edit_rule(&store, id, &matches);
        return;
    }

    if let Some(ids) = matches.get_many::<String>("delete") {
        let ids: Vec<&String> = ids.collect();
        match store.delete_rules(&ids) {
            Ok(removed) => {
                for rule in removed {
                    println!(
                        "🗑️  Deleted rule {}: {} '{}'",
                        rule.short_id(),
                        rule.match_type,
                        rule.pattern
                    );
                }
            }
            Err(e) => exit_store_error(e),
        }
        return;
    }

    if let Some(id) = matches.get_one::<String>("move") {
        let position = matches.get_one::<usize>("to").copied().unwrap_or(1);
        match store.move_rule(id, position.saturating_sub(1)) {
            Ok(rule) => println!("✅ Moved rule {} to position {position}", rule.short_id()),
            Err(e) => exit_store_error(e),
        }
        return;
    }

    if let Some(action) = parse_arg::<Action>(&matches, "set-default") {
        match store.set_default_action(action) {
            Ok(()) => println!("✅ Default action set to {action}"),
            Err(e) => exit_store_error(e),
        }
        return;
    }

    if matches.get_flag("list") {
        list_rules(&store);
        return;
    }

    if let Some(from) = matches.get_one::<String>("test-sender") {
        test_sender(&store, from);
        return;
    }

    if matches.get_flag("dry-run") || matches.get_flag("apply") {
        let options = BatchOptions {
            dry_run: !matches.get_flag("apply"),
            query: settings.query.clone(),
            limit: matches.get_one::<usize>("limit").copied(),
        };
        run_pass(&settings, &store, options);
        return;
    }

    let _ = cli().print_help();
    println!();
}

fn load_settings(matches: &ArgMatches) -> anyhow::Result<Settings> {
    let mut settings = Settings::load(matches.get_one::<String>("config").map(String::as_str))?;

    if let Some(path) = matches.get_one::<String>("rules") {
        settings.rules_path = path.into();
    }
    if let Some(path) = matches.get_one::<String>("log-file") {
        settings.log_path = path.into();
    }
    if let Some(path) = matches.get_one::<String>("token") {
        settings.token_path = path.into();
    }
    if let Some(query) = matches.get_one::<String>("query") {
        settings.query = query.clone();
    }
    Ok(settings)
}

fn parse_arg<T: std::str::FromStr>(matches: &ArgMatches, name: &str) -> Option<T> {
    // value_parser already restricted the input to valid names
    matches
        .get_one::<String>(name)
        .and_then(|value| value.parse().ok())
}

fn generate_default_config(path: &str) {
    let settings = Settings::default();
    match settings.to_file(path) {
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

fn exit_store_error(e: StoreError) -> ! {
    match e {
        StoreError::DuplicateRule { .. }
        | StoreError::EmptyPattern
        | StoreError::InvalidRegex { .. }
        | StoreError::RuleNotFound(_)
        | StoreError::AmbiguousId(_) => eprintln!("⚠️  Warning: {e}"),
        StoreError::Io { .. } | StoreError::Malformed { .. } => eprintln!("❌ Error: {e}"),
    }
    process::exit(1);
}

fn edit_rule(store: &RuleStore, id: &str, matches: &ArgMatches) {
    let current = match store.find(id) {
        Ok(rule) => rule,
        Err(e) => exit_store_error(e),
    };

    let pattern = matches
        .get_one::<String>("pattern")
        .cloned()
        .unwrap_or_else(|| current.pattern.clone());
    let match_type = parse_arg::<MatchType>(matches, "match-type").unwrap_or(current.match_type);
    let action = parse_arg::<Action>(matches, "action").unwrap_or(current.action);

    match store.update_rule(&current.id.to_string(), &pattern, match_type, action) {
        Ok(rule) => println!(
            "✅ Updated rule {}: {} '{}' -> {}",
            rule.short_id(),
            rule.match_type,
            rule.pattern,
            rule.action
        ),
        Err(e) => exit_store_error(e),
    }
}

fn list_rules(store: &RuleStore) {
    let rule_set = match store.load() {
        Ok(rule_set) => rule_set,
        Err(e) => exit_store_error(e),
    };

    println!("📋 Rules in {}", store.path().display());
    if rule_set.rules.is_empty() {
        println!("  (no rules)");
    } else {
        println!("┌─────┬──────────┬──────────────────────────────────────────┬────────┬──────────────┐");
        println!("│   # │ Id       │ Pattern                                  │ Type   │ Action       │");
        println!("├─────┼──────────┼──────────────────────────────────────────┼────────┼──────────────┤");
        for (i, rule) in rule_set.rules.iter().enumerate() {
            println!(
                "│ {:>3} │ {} │ {:<40} │ {:<6} │ {:<12} │",
                i + 1,
                rule.short_id(),
                truncate_string(&rule.pattern, 40),
                rule.match_type.as_str(),
                rule.action.as_str()
            );
        }
        println!("└─────┴──────────┴──────────────────────────────────────────┴────────┴──────────────┘");
    }
    println!("  Default action: {}", rule_set.default_action);
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

fn test_sender(store: &RuleStore, from: &str) {
    let rule_set = match store.load() {
        Ok(rule_set) => rule_set,
        Err(e) => exit_store_error(e),
    };
    let engine = match RuleEngine::new(rule_set) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("❌ Error: {e}");
            process::exit(1);
        }
    };

    let sender = extract_address(from);
    let decision = engine.evaluate(&sender);

    println!("🧪 Sender: {sender}");
    match decision.rule {
        Some(rule) => println!(
            "   Matched rule {} ({} '{}')",
            rule.short_id(),
            rule.match_type,
            rule.pattern
        ),
        None => println!("   No rules matched - default action"),
    }
    println!("   Result: {}", decision.action);
}

fn run_pass(settings: &Settings, store: &RuleStore, options: BatchOptions) {
    let log = AuditLog::new(settings.log_path.clone());

    let result = start_pass(settings, store, &log, options);
    match result {
        Ok(report) => print_report(&report),
        Err(e) => {
            let reauthorize = matches!(e.downcast_ref::<BatchError>(), Some(BatchError::Reauthorize(_)))
                || e.downcast_ref::<MailError>().is_some_and(MailError::is_auth);
            if reauthorize {
                eprintln!("🔑 {e:#}");
                eprintln!(
                    "   Authorize again and replace {}",
                    settings.token_path.display()
                );
            } else {
                eprintln!("❌ Error: {e:#}");
            }
            println!("Check {} for results.", log.path().display());
            process::exit(if reauthorize { EXIT_REAUTHORIZE } else { 1 });
        }
    }
}

fn start_pass(
    settings: &Settings,
    store: &RuleStore,
    log: &AuditLog,
    options: BatchOptions,
) -> anyhow::Result<BatchReport> {
    let engine = RuleEngine::new(store.load()?)?;

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(settings.request_timeout_seconds))
        .user_agent(concat!("inbox-triage/", env!("CARGO_PKG_VERSION")))
        .build()?;
    let mut tokens = RefreshingToken::load(TokenFile::new(settings.token_path.clone()), client.clone())?;
    // Fail before touching any message if the account needs authorizing again
    tokens.access_token()?;
    let mut session = GmailSession::with_client(client, &settings.api_base, Box::new(tokens))?;

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        log::warn!("Interrupt received, stopping after the current message");
        flag.store(true, Ordering::SeqCst);
    }) {
        log::warn!("Failed to install interrupt handler: {e}");
    }

    let report = BatchProcessor::new(&engine, log, options)
        .with_cancel_flag(cancel)
        .run(&mut session)?;
    Ok(report)
}

fn print_report(report: &BatchReport) {
    if report.dry_run {
        println!("🧪 Dry run complete");
    } else {
        println!("✅ Actions applied");
    }
    println!("  Messages listed: {}", report.listed);
    println!("  ├─ Processed: {}", report.processed);
    for action in Action::ALL {
        let count = report.count(action);
        if count > 0 {
            println!("  │   {:<12} {count}", action.as_str());
        }
    }
    println!("  └─ Failed: {}", report.failed);
    if report.interrupted {
        println!("  ⚠️  Interrupted before all messages were processed");
    }
    println!("Check {} for results.", report.log_path.display());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        cli().debug_assert();
    }

    #[test]
    fn test_overrides_apply_on_top_of_settings() {
        let matches = cli()
            .try_get_matches_from([
                "inbox-triage",
                "--rules",
                "/tmp/r.json",
                "--query",
                "in:inbox is:unread",
                "--dry-run",
            ])
            .unwrap();
        let settings = load_settings(&matches).unwrap();
        assert_eq!(settings.rules_path, std::path::PathBuf::from("/tmp/r.json"));
        assert_eq!(settings.query, "in:inbox is:unread");
    }

    #[test]
    fn test_dry_run_and_apply_conflict() {
        assert!(cli()
            .try_get_matches_from(["inbox-triage", "--dry-run", "--apply"])
            .is_err());
    }

    #[test]
    fn test_commands_are_mutually_exclusive() {
        for args in [
            &["inbox-triage", "--add", "a@b.com", "--apply"][..],
            &["inbox-triage", "--list", "--test-sender", "a@b.com"][..],
            &["inbox-triage", "--delete", "abcd1234", "--dry-run"][..],
            &["inbox-triage", "--set-default", "keep", "--move", "abcd", "--to", "1"][..],
        ] {
            assert!(cli().try_get_matches_from(args).is_err(), "accepted {args:?}");
        }
    }

    #[test]
    fn test_command_options_combine_with_their_command() {
        assert!(cli()
            .try_get_matches_from(["inbox-triage", "--edit", "abcd", "--pattern", "x.com", "-m", "domain"])
            .is_ok());
        assert!(cli()
            .try_get_matches_from(["inbox-triage", "--apply", "--limit", "10", "-q", "in:inbox"])
            .is_ok());
    }

    #[test]
    fn test_bad_action_is_rejected_by_parser() {
        assert!(cli()
            .try_get_matches_from(["inbox-triage", "--add", "a@b.com", "--action", "explode"])
            .is_err());
    }

    #[test]
    fn test_parse_arg() {
        let matches = cli()
            .try_get_matches_from(["inbox-triage", "--add", "a@b.com", "-m", "domain", "-a", "move_to_spam"])
            .unwrap();
        assert_eq!(parse_arg::<MatchType>(&matches, "match-type"), Some(MatchType::Domain));
        assert_eq!(parse_arg::<Action>(&matches, "action"), Some(Action::MoveToSpam));
        assert_eq!(parse_arg::<Action>(&matches, "set-default"), None);
    }

    #[test]
    fn test_truncate_string() {
        assert_eq!(truncate_string("short", 10), "short");
        assert_eq!(truncate_string("abcdefghijkl", 8), "abcde...");
    }
}
