use anyhow::{Context, Result, bail};
use std::path::Path;

use idhini_db::{
    DispatchPayload, LineItemInput, RecordKey, RecordState, RequestPayload, SubjectKind,
    WorkflowRecord,
};

use crate::commands::audit::print_entry;
use crate::database_manager::DatabaseManager;

/// Parses `SKU:QTY` or `SKU:QTY:NOTE`.
pub fn parse_item(raw: &str) -> Result<LineItemInput> {
    let mut parts = raw.splitn(3, ':');

    let sku = parts.next().unwrap_or_default();
    let Some(quantity) = parts.next() else {
        bail!("Invalid item '{}'. Expected SKU:QTY[:NOTE]", raw);
    };
    let quantity: i64 = quantity
        .trim()
        .parse()
        .with_context(|| format!("Invalid quantity in item '{}'", raw))?;

    let item = LineItemInput::new(sku, quantity);
    Ok(match parts.next() {
        Some(note) => item.with_note(note),
        None => item,
    })
}

pub fn load_items<P: AsRef<Path>>(file: P) -> Result<Vec<LineItemInput>> {
    let file_path = file.as_ref();

    if !file_path.exists() {
        bail!("Items file not found: {}", file_path.display());
    }

    let content = std::fs::read_to_string(file_path).context("Failed to read items file")?;

    let items = match file_path.extension().and_then(|s| s.to_str()) {
        Some("json") => serde_json::from_str(&content).context("Failed to parse JSON items")?,
        Some("yaml") | Some("yml") => {
            serde_yaml::from_str(&content).context("Failed to parse YAML items")?
        }
        _ => {
            bail!("Unsupported file format. Use .json, .yaml, or .yml");
        }
    };

    Ok(items)
}

fn collect_items(raw_items: &[String], file: Option<&Path>) -> Result<Vec<LineItemInput>> {
    let mut items = match file {
        Some(path) => load_items(path)?,
        None => Vec::new(),
    };

    for raw in raw_items {
        items.push(parse_item(raw)?);
    }

    Ok(items)
}

pub fn create(
    manager: &DatabaseManager,
    kind: SubjectKind,
    maker: &str,
    raw_items: &[String],
    file: Option<&Path>,
    source_request: Option<u64>,
) -> Result<()> {
    let line_items = collect_items(raw_items, file)?;
    let service = manager.service();

    let record = match kind {
        SubjectKind::ProductRequest => {
            if source_request.is_some() {
                bail!("--source-request only applies to dispatches");
            }
            service.create_request(maker, RequestPayload { line_items })?
        }
        SubjectKind::Dispatch => service.create_dispatch(
            maker,
            DispatchPayload {
                source_request_id: source_request,
                line_items,
            },
        )?,
    };

    println!("Created {} (pending)", record.key);
    Ok(())
}

pub fn approve(manager: &DatabaseManager, key: RecordKey, checker: &str) -> Result<()> {
    let outcome = manager.service().approve(key, checker)?;
    println!("{} (audit #{})", outcome.message, outcome.log_id);
    Ok(())
}

pub fn reject(
    manager: &DatabaseManager,
    key: RecordKey,
    checker: &str,
    reason: &str,
) -> Result<()> {
    let outcome = manager.service().reject(key, checker, reason)?;
    println!("{} (audit #{})", outcome.message, outcome.log_id);
    Ok(())
}

fn print_record(record: &WorkflowRecord) {
    println!("{}", record.key);
    println!("  state:    {}", record.state);
    println!("  maker:    {}", record.maker_id);
    println!("  created:  {}", record.created_at);

    if let Some(checker) = &record.checker_id {
        println!("  checker:  {}", checker);
    }
    if let Some(resolved_at) = record.resolved_at {
        println!("  resolved: {}", resolved_at);
    }
    if let Some(reason) = &record.resolution_reason {
        println!("  reason:   {}", reason);
    }
    if let Some(source) = record.source_request_id {
        println!("  source:   {}", RecordKey::request(source));
    }

    println!("  items:");
    for item in &record.line_items {
        match &item.note {
            Some(note) => println!(
                "    {:>3}. {} x{} ({})",
                item.line_number, item.sku, item.quantity, note
            ),
            None => println!("    {:>3}. {} x{}", item.line_number, item.sku, item.quantity),
        }
    }
}

pub fn show(manager: &DatabaseManager, key: RecordKey) -> Result<()> {
    match manager.service().get_by_id(key)? {
        Some(record) => print_record(&record),
        None => println!("No {} found", key),
    }
    Ok(())
}

pub fn list(
    manager: &DatabaseManager,
    kind: SubjectKind,
    state: Option<RecordState>,
) -> Result<()> {
    let records = match state {
        Some(state) => manager.service().list_by_state(kind, state)?,
        None => manager.service().list_all(kind)?,
    };

    if records.is_empty() {
        println!("No {} records", kind);
    }

    for record in &records {
        println!(
            "{:<22} {:<9} maker {:<12} items {:>3} qty {:>6}",
            record.key.to_string(),
            record.state.as_str(),
            record.maker_id,
            record.line_items.len(),
            record.total_quantity()
        );
    }

    Ok(())
}

pub fn log(manager: &DatabaseManager, key: RecordKey) -> Result<()> {
    let entries = manager.service().get_audit_log(key)?;

    if entries.is_empty() {
        println!("No audit entries for {}", key);
    }

    for entry in &entries {
        print_entry(entry);
    }

    Ok(())
}
