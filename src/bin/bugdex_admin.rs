use std::collections::BTreeMap;

use anyhow::{anyhow, bail};
use bugdex_rs::config::{BugdexConfig, ConfigOverrides, StoreOverrides};
use bugdex_rs::{
    Bugdex, CanonicalId, EntityRef, RecordRef, SourceKey, SourceObservation, UniversalId,
    UniversalRecord,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

const VALUE_FLAGS: [&str; 6] = ["--config", "-c", "--data-dir", "-d", "--canonical", "--attr"];

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn parse_all(flag: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            if let Some(value) = args.next() {
                values.push(value);
            }
        }
    }
    values
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

/// Arguments that are neither flags nor flag values.
fn positionals() -> Vec<String> {
    let mut positionals = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if VALUE_FLAGS.contains(&arg.as_str()) {
            args.next();
        } else if !arg.starts_with('-') {
            positionals.push(arg);
        }
    }
    positionals
}

fn print_help() {
    eprintln!(
        r#"bugdex_admin - Bugdex identity administration

USAGE:
    bugdex_admin [OPTIONS] <COMMAND> [ARGS]

COMMANDS:
    propose <universal-id> <source> <id>   Create or heal a universal record
    ingest <source> <id>                   Store a source record and propose it
    resolve <ref>                          Show a record, or a group's current successor
    related <ref>                          List records in the same canonical group
    merge <keep-ref> <absorb-ref>          Merge the second group into the first
    delete <source> <id>                   Deep delete a source record locally
    gc [<canonical-id>]                    Reconcile one group, or sweep all groups
    audit                                  Report pointer/cache inconsistencies
    tombstone <canonical-id>               Show the tombstone chain of a retired group
    stats                                  Row counts per table

REFERENCES:
    universal:<id>, source:<source>:<id>, canonical:<id> (short: u:, s:, c:)

OPTIONS:
    -c, --config <FILE>      Path to config file (TOML)
    -d, --data-dir <DIR>     Override store data directory
        --canonical <ID>     Group to join (propose, ingest)
        --attr <KEY=VALUE>   Source record attribute, repeatable (ingest)
    -h, --help               Print help

ENVIRONMENT:
    BUGDEX_CONFIG            Path to config file
    BUGDEX_STORE__DATA_DIR   Store data directory
"#
    );
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn arg(positionals: &[String], index: usize, name: &str) -> anyhow::Result<String> {
    positionals
        .get(index)
        .cloned()
        .ok_or_else(|| anyhow!("missing argument <{name}>"))
}

fn parse_attributes(raw: Vec<String>) -> anyhow::Result<BTreeMap<String, String>> {
    raw.into_iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .ok_or_else(|| anyhow!("expected KEY=VALUE, got '{pair}'"))
        })
        .collect()
}

fn group_id_of(bugdex: &Bugdex, reference: EntityRef) -> anyhow::Result<CanonicalId> {
    match reference {
        EntityRef::Canonical(id) => Ok(id),
        other => {
            let record: RecordRef = other.try_into()?;
            Ok(bugdex.canonical_group_of(&record)?.id)
        }
    }
}

fn run(bugdex: &Bugdex, positionals: &[String]) -> anyhow::Result<()> {
    let command = arg(positionals, 0, "command")?;
    let canonical = parse_arg("--canonical").map(CanonicalId::new);

    match command.as_str() {
        "propose" => {
            let universal_id = UniversalId::new(arg(positionals, 1, "universal-id")?);
            let key = SourceKey::new(arg(positionals, 2, "source")?, arg(positionals, 3, "id")?);
            print_json(&bugdex.propose(&universal_id, &key, canonical.as_ref())?)
        }
        "ingest" => {
            let mut observation =
                SourceObservation::new(arg(positionals, 1, "source")?, arg(positionals, 2, "id")?);
            observation.attributes = parse_attributes(parse_all("--attr"))?;
            print_json(&bugdex.ingest(observation, canonical.as_ref())?)
        }
        "resolve" => match arg(positionals, 1, "ref")?.parse::<EntityRef>()? {
            EntityRef::Canonical(id) => {
                let current = bugdex.resolve_canonical(&id)?;
                let group = match &current {
                    Some(current) => bugdex.store().get_group(current)?,
                    None => None,
                };
                print_json(&serde_json::json!({
                    "requested": id,
                    "current": current,
                    "group": group,
                }))
            }
            other => {
                let reference: RecordRef = other.try_into()?;
                let record = bugdex.resolve(&reference)?;
                let group = bugdex.store().get_group(&record.canonical_id)?;
                print_json(&serde_json::json!({ "record": record, "group": group }))
            }
        },
        "related" => {
            let reference: RecordRef = arg(positionals, 1, "ref")?.parse::<EntityRef>()?.try_into()?;
            let related: Vec<UniversalRecord> =
                bugdex.related_bugs(&reference)?.collect::<Result<_, _>>()?;
            print_json(&related)
        }
        "merge" => {
            let keep = group_id_of(bugdex, arg(positionals, 1, "keep-ref")?.parse()?)?;
            let absorb = group_id_of(bugdex, arg(positionals, 2, "absorb-ref")?.parse()?)?;
            bugdex.merge(&keep, &absorb)?;
            print_json(&bugdex.group(&keep)?)
        }
        "delete" => {
            let key = SourceKey::new(arg(positionals, 1, "source")?, arg(positionals, 2, "id")?);
            print_json(&bugdex.deep_delete(&key)?)
        }
        "gc" => match positionals.get(1) {
            Some(id) => {
                let id = CanonicalId::new(id.as_str());
                let outcome = bugdex
                    .garbage_collect(&id)?
                    .ok_or_else(|| anyhow!("canonical group not found: {id}"))?;
                print_json(&outcome)
            }
            None => print_json(&bugdex.garbage_collect_all()?),
        },
        "audit" => {
            let report = bugdex.audit()?;
            print_json(&report)?;
            if !report.is_clean() {
                bail!("{} violations found", report.violations.len());
            }
            Ok(())
        }
        "tombstone" => {
            let id = CanonicalId::new(arg(positionals, 1, "canonical-id")?);
            print_json(&bugdex.tombstone_chain(&id)?)
        }
        "stats" => print_json(&bugdex.stats()?),
        other => bail!("unknown command '{other}', see --help"),
    }
}

fn main() -> anyhow::Result<()> {
    if has_flag("-h") || has_flag("--help") {
        print_help();
        return Ok(());
    }

    let mut overrides = ConfigOverrides::default();
    if let Some(data_dir) = parse_arg("--data-dir").or_else(|| parse_arg("-d")) {
        overrides.store = Some(StoreOverrides {
            data_dir: Some(data_dir.into()),
            ..Default::default()
        });
    }
    let config_path = parse_arg("--config")
        .or_else(|| parse_arg("-c"))
        .or_else(|| std::env::var("BUGDEX_CONFIG").ok());
    let config = BugdexConfig::load(config_path.as_deref(), overrides)?;

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .init();

    let bugdex = Bugdex::open(&config.store)?;
    let result = run(&bugdex, &positionals());
    bugdex.flush()?;
    result
}
