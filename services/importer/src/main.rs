//! Importer Service - Loads contract opportunity exports into PostgreSQL
//!
//! Responsibilities:
//! - Read a delimited or spreadsheet export of contract opportunities
//! - Detect text encoding by trial before the full read
//! - Normalize raw values (sentinels, dates, money, booleans)
//! - Backfill NAICS and state lookup rows referenced by each batch
//! - Upsert contracts keyed by notice id, one transaction per batch
//! - Refresh the spend materialized views after the load
//!
//! Re-running against the same file is safe: rows are keyed by the
//! source-provided notice id, and a conflict updates only the small mutable
//! subset (title, award amount, awardee) instead of duplicating the row.

use anyhow::{Context, Result};
use calamine::{open_workbook_auto, Data, Reader};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use clap::Parser;
use encoding_rs::Encoding;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};
use std::collections::BTreeSet;
use std::path::Path;
use tokio::fs;

#[derive(Parser, Debug)]
#[command(name = "importer", about = "Loads contract opportunity exports into the contracts table")]
struct Args {
    /// Path to the source file (.csv, .xls or .xlsx)
    #[arg(long)]
    file: String,

    /// Rows per transaction
    #[arg(long, default_value = "1000")]
    batch_size: usize,

    /// Read at most this many source rows (sampling aid)
    #[arg(long)]
    limit: Option<usize>,

    /// Read and normalize only - no database writes
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Skip the materialized view refresh after loading
    #[arg(long, default_value = "false")]
    skip_refresh: bool,
}

#[derive(Debug, Clone)]
struct Config {
    database_url: String,
}

impl Config {
    /// DATABASE_URL wins; otherwise the URL is assembled from discrete
    /// settings. Host, port and database name have development defaults,
    /// credentials do not.
    fn from_env() -> Result<Self> {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            return Ok(Self { database_url: url });
        }
        let host = std::env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string());
        let port = std::env::var("DB_PORT").unwrap_or_else(|_| "5432".to_string());
        let name = std::env::var("DB_NAME").unwrap_or_else(|_| "govchime".to_string());
        let user = std::env::var("DB_USER")
            .context("DB_USER env var missing (set it or provide DATABASE_URL)")?;
        let password = std::env::var("DB_PASSWORD")
            .context("DB_PASSWORD env var missing (set it or provide DATABASE_URL)")?;
        Ok(Self {
            database_url: format!("postgres://{}:{}@{}:{}/{}", user, password, host, port, name),
        })
    }
}

// =============================================================================
// COLUMN ALIASES
// =============================================================================
// Two header conventions coexist across source vintages: the camelCase
// API-style export and the snake_case export, plus a handful of archived
// spellings ("Sol#", "Award$", "Department/Ind.Agency"). Aliases are listed
// in priority order; at row access the first present, non-empty value wins.
// Headers are matched trimmed and case-insensitively.

const CONTRACT_COLUMNS: &[(&str, &[&str])] = &[
    ("notice_id", &["noticeId", "notice_id"]),
    ("title", &["title"]),
    ("sol_number", &["solicitationNumber", "Sol#", "sol_number", "solicitation_number"]),
    ("department_agency", &["departmentName", "Department/Ind.Agency", "department_agency"]),
    ("sub_tier", &["subTier", "Sub-Tier", "sub_tier"]),
    ("office", &["office"]),
    ("office_address", &["officeAddress", "office_address"]),
    ("posted_date", &["postedDate", "posted_date"]),
    ("type", &["type"]),
    ("base_type", &["baseType", "base_type"]),
    ("archive_type", &["archiveType", "archive_type"]),
    ("archive_date", &["archiveDate", "archive_date"]),
    ("set_aside_code", &["setAsideCode", "SetASideCode", "set_aside_code"]),
    ("set_aside_description", &["setAsideDescription", "SetASide", "set_aside_description", "set_aside"]),
    ("response_deadline", &["responseDeadLine", "response_deadline"]),
    ("naics_code", &["naicsCode", "naics_code"]),
    ("classification_code", &["classificationCode", "classification_code"]),
    ("pop_street_address", &["popStreetAddress", "popAddress", "pop_street_address", "pop_address"]),
    ("pop_city", &["popCity", "pop_city"]),
    ("pop_state", &["popState", "pop_state"]),
    ("pop_zip", &["popZip", "pop_zip"]),
    ("pop_country", &["popCountry", "pop_country"]),
    ("active", &["active"]),
    ("award_number", &["awardNumber", "award_number"]),
    ("award_date", &["awardDate", "award_date"]),
    ("award_amount", &["awardAmount", "Award$", "award_amount"]),
    ("awardee", &["awardee"]),
    ("organization_type", &["organizationType", "organization_type"]),
    ("state", &["state"]),
    ("city", &["city"]),
    ("zip_code", &["zipCode", "zip_code", "zip"]),
    ("country_code", &["countryCode", "country_code"]),
    ("additional_info_link", &["additionalInfoLink", "additional_info_link"]),
    ("link", &["link"]),
    ("description", &["description"]),
];

/// Header positions for every logical field, resolved once per source file.
/// Positions are kept in alias priority order, not header order.
struct ColumnMap {
    fields: Vec<(&'static str, Vec<usize>)>,
}

impl ColumnMap {
    fn resolve(headers: &[String]) -> Self {
        let fields = CONTRACT_COLUMNS
            .iter()
            .map(|(field, aliases)| {
                let mut indexes = Vec::new();
                for alias in *aliases {
                    for (idx, header) in headers.iter().enumerate() {
                        if header.trim().eq_ignore_ascii_case(alias) {
                            indexes.push(idx);
                        }
                    }
                }
                (*field, indexes)
            })
            .collect();
        Self { fields }
    }

    fn indexes(&self, field: &str) -> &[usize] {
        self.fields
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, indexes)| indexes.as_slice())
            .unwrap_or(&[])
    }
}

/// One source row addressed through the alias table.
struct RowView<'a> {
    map: &'a ColumnMap,
    cells: &'a [String],
}

impl RowView<'_> {
    /// First alias whose cleaned value is present.
    fn text(&self, field: &str) -> Option<String> {
        self.map
            .indexes(field)
            .iter()
            .filter_map(|&idx| self.cells.get(idx))
            .find_map(|raw| clean_value(raw))
    }

    fn date(&self, field: &str) -> Option<NaiveDate> {
        self.text(field).as_deref().and_then(parse_date)
    }

    fn datetime(&self, field: &str) -> Option<DateTime<Utc>> {
        self.text(field).as_deref().and_then(parse_datetime)
    }

    fn amount(&self, field: &str) -> Option<f64> {
        self.text(field).as_deref().and_then(parse_decimal)
    }

    fn flag(&self, field: &str) -> Option<bool> {
        parse_boolean(self.text(field).as_deref())
    }
}

// =============================================================================
// VALUE NORMALIZATION
// =============================================================================

/// Sentinel spellings the sources use to mean "no value".
const NULL_SENTINELS: &[&str] = &["NULL", "NONE", "N/A", "NA"];

/// Map blanks and sentinel spellings to None; trim everything else.
fn clean_value(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if NULL_SENTINELS.iter().any(|s| trimmed.eq_ignore_ascii_case(s)) {
        return None;
    }
    Some(trimmed.to_string())
}

/// Candidate date formats, tried in order. First full match wins.
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d", "%d-%m-%Y"];

/// Tolerant date parser: anything outside the candidate list is None.
fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
}

/// Datetime formats carrying an explicit offset. `%#z` also accepts the
/// short `-04` suffix the archived exports put on response deadlines.
const OFFSET_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%#z",
    "%Y-%m-%d %H:%M:%S%.f%#z",
];

/// Naive datetime formats, interpreted as UTC.
const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
];

/// Tolerant datetime parser. RFC 3339 first (a bare `Z` is accepted there),
/// then the offset and naive forms, then a plain date at midnight UTC.
fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in OFFSET_DATETIME_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(trimmed, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in NAIVE_DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(dt.and_utc());
        }
    }
    parse_date(trimmed)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Strip currency noise and parse. Negative or non-finite results are
/// rejected: award amounts are non-negative.
fn parse_decimal(raw: &str) -> Option<f64> {
    let stripped = raw.replace('$', "").replace(',', "");
    let cleaned = clean_value(&stripped)?;
    let value: f64 = cleaned.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some(value)
}

/// Affirmative spellings for boolean-like fields.
const TRUE_TOKENS: &[&str] = &["true", "yes", "1", "t", "y"];

/// Absent stays None so each caller picks its own missing-value policy;
/// the active flag maps missing to false.
fn parse_boolean(raw: Option<&str>) -> Option<bool> {
    let value = raw?.trim();
    if value.is_empty() {
        return None;
    }
    Some(TRUE_TOKENS.iter().any(|t| value.eq_ignore_ascii_case(t)))
}

/// Numeric source columns leak float artifacts ("531120.0"). One canonical
/// form is stored: a value parsing as a non-negative integral float renders
/// as its pure digit string; anything else passes through trimmed.
fn canonicalize_naics(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Ok(value) = trimmed.parse::<f64>() {
        if value.is_finite() && value >= 0.0 && value.fract() == 0.0 && value < 1e15 {
            return format!("{}", value as u64);
        }
    }
    trimmed.to_string()
}

/// Lookup rows are only created for plausible 2-letter state codes.
fn valid_state_code(code: &str) -> bool {
    code.len() == 2
}

// =============================================================================
// CONTRACT RECORDS
// =============================================================================

/// One normalized contract row, keyed by the source-provided notice id.
#[derive(Debug, Clone)]
struct Contract {
    notice_id: String,
    title: Option<String>,
    sol_number: Option<String>,
    department_agency: Option<String>,
    sub_tier: Option<String>,
    office: Option<String>,
    office_address: Option<String>,
    posted_date: Option<NaiveDate>,
    notice_type: Option<String>,
    base_type: Option<String>,
    archive_type: Option<String>,
    archive_date: Option<NaiveDate>,
    set_aside_code: Option<String>,
    set_aside_description: Option<String>,
    response_deadline: Option<DateTime<Utc>>,
    naics_code: Option<String>,
    classification_code: Option<String>,
    pop_street_address: Option<String>,
    pop_city: Option<String>,
    pop_state: Option<String>,
    pop_zip: Option<String>,
    pop_country: Option<String>,
    active: bool,
    award_number: Option<String>,
    award_date: Option<NaiveDate>,
    award_amount: Option<f64>,
    awardee: Option<String>,
    organization_type: Option<String>,
    state: Option<String>,
    city: Option<String>,
    zip_code: Option<String>,
    country_code: Option<String>,
    additional_info_link: Option<String>,
    link: Option<String>,
    description: Option<String>,
}

/// Build a contract from a raw row. None when the natural key is absent;
/// such rows never reach the loader.
fn normalize_row(map: &ColumnMap, cells: &[String]) -> Option<Contract> {
    let row = RowView { map, cells };
    let notice_id = row.text("notice_id")?;
    Some(Contract {
        notice_id,
        title: row.text("title"),
        sol_number: row.text("sol_number"),
        department_agency: row.text("department_agency"),
        sub_tier: row.text("sub_tier"),
        office: row.text("office"),
        office_address: row.text("office_address"),
        posted_date: row.date("posted_date"),
        notice_type: row.text("type"),
        base_type: row.text("base_type"),
        archive_type: row.text("archive_type"),
        archive_date: row.date("archive_date"),
        set_aside_code: row.text("set_aside_code"),
        set_aside_description: row.text("set_aside_description"),
        response_deadline: row.datetime("response_deadline"),
        naics_code: row.text("naics_code").map(|c| canonicalize_naics(&c)),
        classification_code: row.text("classification_code"),
        pop_street_address: row.text("pop_street_address"),
        pop_city: row.text("pop_city"),
        pop_state: row.text("pop_state"),
        pop_zip: row.text("pop_zip"),
        pop_country: row.text("pop_country"),
        active: row.flag("active").unwrap_or(false),
        award_number: row.text("award_number"),
        award_date: row.date("award_date"),
        award_amount: row.amount("award_amount"),
        awardee: row.text("awardee"),
        organization_type: row.text("organization_type"),
        state: row.text("state"),
        city: row.text("city"),
        zip_code: row.text("zip_code"),
        country_code: row.text("country_code"),
        additional_info_link: row.text("additional_info_link"),
        link: row.text("link"),
        description: row.text("description"),
    })
}

// =============================================================================
// SOURCE READER
// =============================================================================

/// Encoding labels tried, in order, against a prefix of the file. The first
/// one that decodes the prefix without errors decodes the full file.
const ENCODING_CANDIDATES: &[&str] = &["utf-8", "latin1", "iso-8859-1", "windows-1252"];

const ENCODING_PROBE_BYTES: usize = 64 * 1024;

fn detect_encoding(bytes: &[u8]) -> Result<&'static Encoding> {
    let probe = &bytes[..bytes.len().min(ENCODING_PROBE_BYTES)];
    for label in ENCODING_CANDIDATES {
        let encoding = match Encoding::for_label(label.as_bytes()) {
            Some(e) => e,
            None => continue,
        };
        let (_, _, had_errors) = encoding.decode(probe);
        if !had_errors {
            return Ok(encoding);
        }
    }
    anyhow::bail!("No candidate encoding decodes the file cleanly")
}

/// Bounded number of detailed per-row/per-batch messages before the rest
/// are summarized.
const MAX_REPORTED_FAILURES: usize = 5;

/// Outcome of reading and normalizing a whole source file.
#[derive(Debug, Default)]
struct ParseOutcome {
    contracts: Vec<Contract>,
    rows_read: usize,
    skipped_missing_key: usize,
    malformed_rows: usize,
}

fn require_notice_column(columns: &ColumnMap) -> Result<()> {
    if columns.indexes("notice_id").is_empty() {
        anyhow::bail!("No notice id column found in header. Expected one of: noticeId, notice_id");
    }
    Ok(())
}

/// Parse a delimited export. Malformed rows are counted and skipped.
fn parse_contracts_csv(content: &str, limit: Option<usize>) -> Result<ParseOutcome> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .context("Failed to read CSV header row")?
        .iter()
        .map(|h| h.to_string())
        .collect();
    let columns = ColumnMap::resolve(&headers);
    require_notice_column(&columns)?;

    let mut outcome = ParseOutcome::default();
    for result in reader.records() {
        if limit.is_some_and(|l| outcome.rows_read >= l) {
            break;
        }
        outcome.rows_read += 1;
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                outcome.malformed_rows += 1;
                if outcome.malformed_rows <= MAX_REPORTED_FAILURES {
                    // +1 for the header line
                    eprintln!("Warning: skipping line {}: {}", outcome.rows_read + 1, e);
                }
                continue;
            }
        };
        let cells: Vec<String> = record.iter().map(|c| c.to_string()).collect();
        match normalize_row(&columns, &cells) {
            Some(contract) => outcome.contracts.push(contract),
            None => outcome.skipped_missing_key += 1,
        }
    }
    Ok(outcome)
}

/// Render a spreadsheet cell the way the delimited exports spell it.
/// Integral floats print without the decimal suffix so numeric code columns
/// keep their digit-string form.
fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::String(s) => s.trim().to_string(),
        Data::Float(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 => {
            format!("{}", *f as i64)
        }
        Data::Int(i) => i.to_string(),
        Data::Empty => String::new(),
        other => format!("{}", other),
    }
}

/// Parse a spreadsheet export. The whole first sheet is read at once.
fn parse_contracts_sheet(path: &Path, limit: Option<usize>) -> Result<ParseOutcome> {
    let mut workbook: calamine::Sheets<_> =
        open_workbook_auto(path).context("Failed to open spreadsheet")?;
    let sheet_names = workbook.sheet_names().to_vec();
    let sheet_name = sheet_names
        .first()
        .context("Spreadsheet has no sheets")?
        .clone();
    let range = workbook
        .worksheet_range(&sheet_name)
        .context("Failed to read sheet")?;

    let mut rows = range.rows();
    let headers: Vec<String> = rows
        .next()
        .context("Sheet has no header row")?
        .iter()
        .map(cell_to_string)
        .collect();
    let columns = ColumnMap::resolve(&headers);
    require_notice_column(&columns)?;

    let mut outcome = ParseOutcome::default();
    for row in rows {
        if limit.is_some_and(|l| outcome.rows_read >= l) {
            break;
        }
        outcome.rows_read += 1;
        let cells: Vec<String> = row.iter().map(cell_to_string).collect();
        match normalize_row(&columns, &cells) {
            Some(contract) => outcome.contracts.push(contract),
            None => outcome.skipped_missing_key += 1,
        }
    }
    Ok(outcome)
}

/// Spreadsheet sources are dispatched by extension.
fn is_spreadsheet(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some(ext) if ext.eq_ignore_ascii_case("xls") || ext.eq_ignore_ascii_case("xlsx")
    )
}

// =============================================================================
// REFERENCE DATA
// =============================================================================

/// Ensure lookup rows exist for every NAICS and state code the batch
/// references. Runs inside the batch transaction, strictly before the
/// contract upserts; DO NOTHING keeps existing titles intact.
async fn ensure_reference_rows(conn: &mut PgConnection, batch: &[Contract]) -> Result<()> {
    let mut naics_codes: BTreeSet<&str> = BTreeSet::new();
    let mut state_codes: BTreeSet<&str> = BTreeSet::new();

    for contract in batch {
        if let Some(code) = contract.naics_code.as_deref() {
            naics_codes.insert(code);
        }
        for code in [contract.state.as_deref(), contract.pop_state.as_deref()] {
            if let Some(code) = code {
                if valid_state_code(code) {
                    state_codes.insert(code);
                }
            }
        }
    }

    for code in naics_codes {
        sqlx::query(
            "INSERT INTO naics_codes (code, title) VALUES ($1, $2) ON CONFLICT (code) DO NOTHING",
        )
        .bind(code)
        .bind(format!("NAICS Code {}", code))
        .execute(&mut *conn)
        .await?;
    }
    for code in state_codes {
        sqlx::query("INSERT INTO states (code, name) VALUES ($1, $2) ON CONFLICT (code) DO NOTHING")
            .bind(code)
            .bind(code)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

// =============================================================================
// BATCH LOADER
// =============================================================================

const CONTRACT_UPSERT: &str = r#"
    INSERT INTO contracts (
        notice_id, title, sol_number, department_agency, sub_tier,
        office, office_address, posted_date, type, base_type,
        archive_type, archive_date, set_aside_code, set_aside_description,
        response_deadline, naics_code, classification_code,
        pop_street_address, pop_city, pop_state, pop_zip, pop_country,
        active, award_number, award_date, award_amount, awardee,
        organization_type, state, city, zip_code, country_code,
        additional_info_link, link, description
    ) VALUES (
        $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
        $11, $12, $13, $14, $15, $16, $17, $18, $19, $20,
        $21, $22, $23, $24, $25, $26, $27, $28, $29, $30,
        $31, $32, $33, $34, $35
    )
    ON CONFLICT (notice_id) DO UPDATE SET
        title = EXCLUDED.title,
        award_amount = EXCLUDED.award_amount,
        awardee = EXCLUDED.awardee
"#;

async fn upsert_contract(conn: &mut PgConnection, contract: &Contract) -> Result<()> {
    sqlx::query(CONTRACT_UPSERT)
        .bind(&contract.notice_id)
        .bind(&contract.title)
        .bind(&contract.sol_number)
        .bind(&contract.department_agency)
        .bind(&contract.sub_tier)
        .bind(&contract.office)
        .bind(&contract.office_address)
        .bind(contract.posted_date)
        .bind(&contract.notice_type)
        .bind(&contract.base_type)
        .bind(&contract.archive_type)
        .bind(contract.archive_date)
        .bind(&contract.set_aside_code)
        .bind(&contract.set_aside_description)
        .bind(contract.response_deadline)
        .bind(&contract.naics_code)
        .bind(&contract.classification_code)
        .bind(&contract.pop_street_address)
        .bind(&contract.pop_city)
        .bind(&contract.pop_state)
        .bind(&contract.pop_zip)
        .bind(&contract.pop_country)
        .bind(contract.active)
        .bind(&contract.award_number)
        .bind(contract.award_date)
        .bind(contract.award_amount)
        .bind(&contract.awardee)
        .bind(&contract.organization_type)
        .bind(&contract.state)
        .bind(&contract.city)
        .bind(&contract.zip_code)
        .bind(&contract.country_code)
        .bind(&contract.additional_info_link)
        .bind(&contract.link)
        .bind(&contract.description)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Load one batch: reference rows first, then the contract upserts, one
/// commit. An error rolls back the whole batch; committed batches are
/// unaffected and a rerun is safe because the upsert is idempotent.
async fn load_batch(pool: &PgPool, batch: &[Contract]) -> Result<()> {
    let mut tx = pool.begin().await?;
    ensure_reference_rows(&mut tx, batch).await?;
    for contract in batch {
        upsert_contract(&mut tx, contract)
            .await
            .with_context(|| format!("Upsert failed for notice {}", contract.notice_id))?;
    }
    tx.commit().await?;
    Ok(())
}

// =============================================================================
// VIEW REFRESH
// =============================================================================

/// Spend aggregates recomputed after a load, one statement each. A failed
/// refresh is reported and never touches committed contract data.
const AGGREGATE_VIEWS: &[&str] = &["mv_spend_by_state", "mv_spend_by_agency", "mv_spend_by_naics"];

async fn refresh_aggregate_views(pool: &PgPool) {
    println!("\nRefreshing materialized views...");
    for view in AGGREGATE_VIEWS {
        match sqlx::query(&format!("REFRESH MATERIALIZED VIEW {}", view))
            .execute(pool)
            .await
        {
            Ok(_) => println!("  ✓ {}", view),
            Err(e) => eprintln!("  ✗ {} refresh failed: {}", view, e),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    println!("=== GovChime Contracts Importer ===");
    println!("File: {}", args.file);
    println!("Batch size: {}", args.batch_size);
    if let Some(limit) = args.limit {
        println!("Limit: {} rows", limit);
    }
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

    let path = Path::new(&args.file);
    if !path.exists() {
        anyhow::bail!("Source file not found: {}", args.file);
    }

    let outcome = if is_spreadsheet(path) {
        println!("\nDetected spreadsheet source - reading whole sheet");
        parse_contracts_sheet(path, args.limit)?
    } else {
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", args.file))?;
        let encoding = detect_encoding(&bytes)?;
        println!("\nDetected encoding: {}", encoding.name());
        let (content, _, _) = encoding.decode(&bytes);
        parse_contracts_csv(&content, args.limit)?
    };

    println!(
        "Read {} rows: {} with a notice id, {} skipped (no notice id), {} malformed",
        outcome.rows_read,
        outcome.contracts.len(),
        outcome.skipped_missing_key,
        outcome.malformed_rows
    );
    for (i, contract) in outcome.contracts.iter().take(3).enumerate() {
        println!(
            "  [{}] {} | {} | posted {}",
            i + 1,
            contract.notice_id,
            contract.title.as_deref().unwrap_or("-"),
            contract
                .posted_date
                .map(|d| d.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
    if outcome.contracts.len() > 3 {
        println!("  ... and {} more", outcome.contracts.len() - 3);
    }

    if args.dry_run {
        println!("\nDry run - nothing written to the database");
        return Ok(());
    }

    let config = Config::from_env()?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    println!("\nLoading batches...");
    let mut upserted = 0usize;
    let mut failed = 0usize;
    let mut batches_committed = 0usize;
    let mut batches_failed = 0usize;

    for batch in outcome.contracts.chunks(args.batch_size) {
        match load_batch(&pool, batch).await {
            Ok(()) => {
                upserted += batch.len();
                batches_committed += 1;
                println!(
                    "Batch {} committed: {} rows ({} total)",
                    batches_committed,
                    batch.len(),
                    upserted
                );
            }
            Err(e) => {
                failed += batch.len();
                batches_failed += 1;
                if batches_failed <= MAX_REPORTED_FAILURES {
                    eprintln!("Batch of {} rows rolled back: {:#}", batch.len(), e);
                }
            }
        }
    }
    if batches_failed > MAX_REPORTED_FAILURES {
        eprintln!(
            "... and {} more failed batches",
            batches_failed - MAX_REPORTED_FAILURES
        );
    }

    if !args.skip_refresh {
        refresh_aggregate_views(&pool).await;
    }

    let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM contracts")
        .fetch_one(&pool)
        .await?;
    let (with_award,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM contracts WHERE award_amount IS NOT NULL AND award_amount > 0",
    )
    .fetch_one(&pool)
    .await?;

    println!("\n=== Import Summary ===");
    println!("Rows read: {}", outcome.rows_read);
    println!("Rows upserted: {}", upserted);
    println!("Rows skipped (no notice id): {}", outcome.skipped_missing_key);
    println!("Rows failed: {}", failed);
    if outcome.malformed_rows > 0 {
        println!("Malformed source rows: {}", outcome.malformed_rows);
    }
    println!("Contracts in database: {}", total);
    println!("Contracts with award amounts: {}", with_award);

    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    // -------------------------------------------------------------------------
    // VALUE CLEANING TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_clean_value_empty_and_whitespace() {
        assert_eq!(clean_value(""), None);
        assert_eq!(clean_value("   "), None);
        assert_eq!(clean_value("\t\n"), None);
    }

    #[test]
    fn test_clean_value_sentinels() {
        assert_eq!(clean_value("NULL"), None);
        assert_eq!(clean_value("null"), None);
        assert_eq!(clean_value("None"), None);
        assert_eq!(clean_value("N/A"), None);
        assert_eq!(clean_value("n/a"), None);
        assert_eq!(clean_value("NA"), None);
        assert_eq!(clean_value("  na  "), None);
    }

    #[test]
    fn test_clean_value_trims() {
        assert_eq!(clean_value("  hello  "), Some("hello".to_string()));
    }

    #[test]
    fn test_clean_value_passthrough() {
        // "Navy" starts like a sentinel but is a real value
        assert_eq!(clean_value("Navy"), Some("Navy".to_string()));
        assert_eq!(clean_value("0"), Some("0".to_string()));
    }

    // -------------------------------------------------------------------------
    // DATE PARSING TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_parse_date_candidate_formats() {
        let expected = NaiveDate::from_ymd_opt(2020, 3, 15).unwrap();
        assert_eq!(parse_date("2020-03-15"), Some(expected));
        assert_eq!(parse_date("03/15/2020"), Some(expected));
        assert_eq!(parse_date("2020/03/15"), Some(expected));
        assert_eq!(parse_date("15-03-2020"), Some(expected));
    }

    #[test]
    fn test_parse_date_rejects_garbage() {
        assert_eq!(parse_date("not a date"), None);
        assert_eq!(parse_date(""), None);
        assert_eq!(parse_date("2020-13-01"), None);
        assert_eq!(parse_date("20200315"), None);
    }

    #[test]
    fn test_parse_date_trims() {
        assert_eq!(
            parse_date("  2020-03-15  "),
            NaiveDate::from_ymd_opt(2020, 3, 15)
        );
    }

    // -------------------------------------------------------------------------
    // DATETIME PARSING TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_parse_datetime_rfc3339_zulu() {
        let expected = Utc.with_ymd_and_hms(2020, 3, 15, 17, 0, 0).unwrap();
        assert_eq!(parse_datetime("2020-03-15T17:00:00Z"), Some(expected));
    }

    #[test]
    fn test_parse_datetime_rfc3339_offset() {
        // 17:00 at -04:00 is 21:00 UTC
        let expected = Utc.with_ymd_and_hms(2020, 3, 15, 21, 0, 0).unwrap();
        assert_eq!(parse_datetime("2020-03-15T17:00:00-04:00"), Some(expected));
    }

    #[test]
    fn test_parse_datetime_short_offset_suffix() {
        // The archived exports spell the offset as a bare "-04"
        let expected = Utc.with_ymd_and_hms(2020, 7, 20, 19, 0, 0).unwrap();
        assert_eq!(parse_datetime("2020-07-20 15:00:00-04"), Some(expected));
    }

    #[test]
    fn test_parse_datetime_naive_forms_are_utc() {
        let expected = Utc.with_ymd_and_hms(2020, 3, 15, 17, 0, 0).unwrap();
        assert_eq!(parse_datetime("2020-03-15 17:00:00"), Some(expected));
        assert_eq!(parse_datetime("2020-03-15T17:00:00"), Some(expected));
    }

    #[test]
    fn test_parse_datetime_fractional_seconds() {
        let expected = Utc.with_ymd_and_hms(2020, 3, 15, 21, 0, 0).unwrap();
        assert_eq!(
            parse_datetime("2020-03-15 17:00:00.000-04:00"),
            Some(expected)
        );
    }

    #[test]
    fn test_parse_datetime_date_only_is_midnight() {
        let expected = Utc.with_ymd_and_hms(2020, 3, 15, 0, 0, 0).unwrap();
        assert_eq!(parse_datetime("2020-03-15"), Some(expected));
    }

    #[test]
    fn test_parse_datetime_rejects_garbage() {
        assert_eq!(parse_datetime("soon"), None);
        assert_eq!(parse_datetime(""), None);
    }

    // -------------------------------------------------------------------------
    // DECIMAL PARSING TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_parse_decimal_currency_noise() {
        assert_eq!(parse_decimal("$1,234.50"), Some(1234.50));
        assert_eq!(parse_decimal("1234.50"), Some(1234.50));
        assert_eq!(parse_decimal("12,345,678.99"), Some(12345678.99));
        assert_eq!(parse_decimal(" $500 "), Some(500.0));
    }

    #[test]
    fn test_parse_decimal_sentinels_and_blanks() {
        assert_eq!(parse_decimal("N/A"), None);
        assert_eq!(parse_decimal(""), None);
        assert_eq!(parse_decimal("   "), None);
    }

    #[test]
    fn test_parse_decimal_rejects_negative() {
        assert_eq!(parse_decimal("-100"), None);
        assert_eq!(parse_decimal("$-1,000.00"), None);
    }

    #[test]
    fn test_parse_decimal_rejects_garbage() {
        assert_eq!(parse_decimal("TBD"), None);
        assert_eq!(parse_decimal("1.2.3"), None);
        assert_eq!(parse_decimal("inf"), None);
        assert_eq!(parse_decimal("NaN"), None);
    }

    // -------------------------------------------------------------------------
    // BOOLEAN PARSING TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_parse_boolean_affirmatives() {
        for token in ["true", "TRUE", "Yes", "1", "t", "Y"] {
            assert_eq!(parse_boolean(Some(token)), Some(true), "token {}", token);
        }
    }

    #[test]
    fn test_parse_boolean_negatives() {
        for token in ["false", "No", "0", "archived"] {
            assert_eq!(parse_boolean(Some(token)), Some(false), "token {}", token);
        }
    }

    #[test]
    fn test_parse_boolean_absent_is_undetermined() {
        assert_eq!(parse_boolean(None), None);
        assert_eq!(parse_boolean(Some("")), None);
        assert_eq!(parse_boolean(Some("  ")), None);
    }

    #[test]
    fn test_active_flag_defaults_to_false() {
        // The active flag maps a missing value to false
        assert!(!parse_boolean(None).unwrap_or(false));
    }

    // -------------------------------------------------------------------------
    // NAICS CANONICALIZATION TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_canonicalize_naics_strips_float_artifact() {
        assert_eq!(canonicalize_naics("531120.0"), "531120");
        assert_eq!(canonicalize_naics("541511.0"), "541511");
    }

    #[test]
    fn test_canonicalize_naics_identity_on_digits() {
        assert_eq!(canonicalize_naics("531120"), "531120");
        assert_eq!(canonicalize_naics("  541511  "), "541511");
    }

    #[test]
    fn test_canonicalize_naics_both_forms_converge() {
        assert_eq!(
            canonicalize_naics("531120.0"),
            canonicalize_naics("531120")
        );
    }

    #[test]
    fn test_canonicalize_naics_passthrough() {
        // Non-numeric and fractional values are left alone
        assert_eq!(canonicalize_naics("R425"), "R425");
        assert_eq!(canonicalize_naics("531120.5"), "531120.5");
        assert_eq!(canonicalize_naics("-541511"), "-541511");
    }

    // -------------------------------------------------------------------------
    // STATE CODE VALIDATION TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_valid_state_code() {
        assert!(valid_state_code("VA"));
        assert!(valid_state_code("tx"));
        assert!(!valid_state_code(""));
        assert!(!valid_state_code("V"));
        assert!(!valid_state_code("VAX"));
    }

    // -------------------------------------------------------------------------
    // COLUMN ALIAS TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_aliases_api_convention() {
        let csv = "noticeId,title,solicitationNumber,awardAmount\n\
                   ABC-1,Road Repair,SOL-9,\"$1,000.00\"\n";
        let outcome = parse_contracts_csv(csv, None).unwrap();
        let c = &outcome.contracts[0];
        assert_eq!(c.notice_id, "ABC-1");
        assert_eq!(c.title.as_deref(), Some("Road Repair"));
        assert_eq!(c.sol_number.as_deref(), Some("SOL-9"));
        assert_eq!(c.award_amount, Some(1000.0));
    }

    #[test]
    fn test_aliases_archived_export_convention() {
        let csv = "NoticeId,Title,Sol#,Award$,PostedDate,Department/Ind.Agency,Sub-Tier\n\
                   XYZ-2,Janitorial,W912-20,\"2,500.50\",2020-01-31,GSA,PBS\n";
        let outcome = parse_contracts_csv(csv, None).unwrap();
        let c = &outcome.contracts[0];
        assert_eq!(c.notice_id, "XYZ-2");
        assert_eq!(c.sol_number.as_deref(), Some("W912-20"));
        assert_eq!(c.award_amount, Some(2500.50));
        assert_eq!(c.posted_date, NaiveDate::from_ymd_opt(2020, 1, 31));
        assert_eq!(c.department_agency.as_deref(), Some("GSA"));
        assert_eq!(c.sub_tier.as_deref(), Some("PBS"));
    }

    #[test]
    fn test_aliases_snake_case_convention() {
        let csv = "notice_id,title,sol_number,naics_code\n\
                   DEF-3,IT Support,RFQ-1,541512\n";
        let outcome = parse_contracts_csv(csv, None).unwrap();
        let c = &outcome.contracts[0];
        assert_eq!(c.notice_id, "DEF-3");
        assert_eq!(c.naics_code.as_deref(), Some("541512"));
    }

    #[test]
    fn test_alias_preference_falls_through_empty() {
        // The camelCase column exists but is empty; the snake_case one wins
        let csv = "noticeId,notice_id,title\n\
                   ,FALLBACK-1,Test\n";
        let outcome = parse_contracts_csv(csv, None).unwrap();
        assert_eq!(outcome.contracts[0].notice_id, "FALLBACK-1");
    }

    #[test]
    fn test_missing_notice_column_fails_fast() {
        let csv = "title,awardAmount\nSomething,100\n";
        let result = parse_contracts_csv(csv, None);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("notice id column"));
    }

    // -------------------------------------------------------------------------
    // ROW NORMALIZATION TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_normalize_full_row() {
        let csv = "noticeId,title,postedDate,responseDeadLine,naicsCode,awardAmount,active,popState,state\n\
                   N-100,Bridge Work,2020-03-15,2020-03-15T17:00:00-04:00,531120.0,\"$9,999.99\",Yes,VA,DC\n";
        let outcome = parse_contracts_csv(csv, None).unwrap();
        let c = &outcome.contracts[0];
        assert_eq!(c.posted_date, NaiveDate::from_ymd_opt(2020, 3, 15));
        assert_eq!(
            c.response_deadline,
            Some(Utc.with_ymd_and_hms(2020, 3, 15, 21, 0, 0).unwrap())
        );
        assert_eq!(c.naics_code.as_deref(), Some("531120"));
        assert_eq!(c.award_amount, Some(9999.99));
        assert!(c.active);
        assert_eq!(c.pop_state.as_deref(), Some("VA"));
        assert_eq!(c.state.as_deref(), Some("DC"));
    }

    #[test]
    fn test_normalize_tolerates_bad_fields() {
        // Unparseable date/amount become absent; the row still loads
        let csv = "noticeId,title,postedDate,awardAmount,active\n\
                   N-101,Fence,someday,lots,\n";
        let outcome = parse_contracts_csv(csv, None).unwrap();
        let c = &outcome.contracts[0];
        assert_eq!(c.posted_date, None);
        assert_eq!(c.award_amount, None);
        assert!(!c.active);
    }

    #[test]
    fn test_sentinel_fields_become_absent() {
        let csv = "noticeId,title,awardee,naicsCode\n\
                   N-102,N/A,NULL,none\n";
        let outcome = parse_contracts_csv(csv, None).unwrap();
        let c = &outcome.contracts[0];
        assert_eq!(c.title, None);
        assert_eq!(c.awardee, None);
        assert_eq!(c.naics_code, None);
    }

    // -------------------------------------------------------------------------
    // READER TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_rows_without_notice_id_are_skipped() {
        let csv = "noticeId,title\n\
                   A-1,First\n\
                   ,Missing Key\n\
                   N/A,Sentinel Key\n\
                   A-2,Second\n";
        let outcome = parse_contracts_csv(csv, None).unwrap();
        assert_eq!(outcome.rows_read, 4);
        assert_eq!(outcome.contracts.len(), 2);
        assert_eq!(outcome.skipped_missing_key, 2);
    }

    #[test]
    fn test_limit_stops_reading() {
        let csv = "noticeId,title\nA-1,a\nA-2,b\nA-3,c\nA-4,d\nA-5,e\n";
        let outcome = parse_contracts_csv(csv, Some(2)).unwrap();
        assert_eq!(outcome.rows_read, 2);
        assert_eq!(outcome.contracts.len(), 2);
    }

    #[test]
    fn test_bom_is_stripped() {
        let csv = "\u{feff}noticeId,title\nB-1,Bom Row\n";
        let outcome = parse_contracts_csv(csv, None).unwrap();
        assert_eq!(outcome.contracts[0].notice_id, "B-1");
    }

    #[test]
    fn test_empty_file_has_no_rows() {
        let csv = "noticeId,title\n";
        let outcome = parse_contracts_csv(csv, None).unwrap();
        assert_eq!(outcome.rows_read, 0);
        assert!(outcome.contracts.is_empty());
    }

    #[test]
    fn test_detect_encoding_utf8() {
        let encoding = detect_encoding("noticeId,title\nA-1,Café\n".as_bytes()).unwrap();
        assert_eq!(encoding.name(), "UTF-8");
    }

    #[test]
    fn test_detect_encoding_falls_through_to_windows_1252() {
        // 0xE9 is not valid UTF-8 on its own but decodes as é in cp1252
        let bytes = b"noticeId,title\nA-1,Caf\xe9\n";
        let encoding = detect_encoding(bytes).unwrap();
        assert_eq!(encoding.name(), "windows-1252");
        let (content, _, _) = encoding.decode(bytes);
        assert!(content.contains("Café"));
    }

    #[test]
    fn test_is_spreadsheet_by_extension() {
        assert!(is_spreadsheet(Path::new("codes.xlsx")));
        assert!(is_spreadsheet(Path::new("codes.XLS")));
        assert!(!is_spreadsheet(Path::new("contracts.csv")));
        assert!(!is_spreadsheet(Path::new("contracts")));
    }

    #[test]
    fn test_cell_to_string_conversions() {
        assert_eq!(cell_to_string(&Data::Float(531120.0)), "531120");
        assert_eq!(cell_to_string(&Data::Float(1234.56)), "1234.56");
        assert_eq!(cell_to_string(&Data::Int(42)), "42");
        assert_eq!(cell_to_string(&Data::String("  hi  ".to_string())), "hi");
        assert_eq!(cell_to_string(&Data::Empty), "");
    }

    // -------------------------------------------------------------------------
    // BATCH PARTITIONING TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_batches_of_2500_rows() {
        let mut csv = String::from("noticeId,title\n");
        for i in 0..2500 {
            csv.push_str(&format!("N-{},Row {}\n", i, i));
        }
        let outcome = parse_contracts_csv(&csv, None).unwrap();
        assert_eq!(outcome.contracts.len(), 2500);

        let sizes: Vec<usize> = outcome.contracts.chunks(1000).map(|b| b.len()).collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
    }

    #[test]
    fn test_batch_count_excludes_keyless_rows() {
        let mut csv = String::from("noticeId,title\n");
        for i in 0..10 {
            csv.push_str(&format!("N-{},Row\n", i));
        }
        csv.push_str(",keyless\n");
        let outcome = parse_contracts_csv(&csv, None).unwrap();
        assert_eq!(outcome.rows_read, 11);
        assert_eq!(outcome.contracts.len(), 10);
        assert_eq!(outcome.skipped_missing_key, 1);
    }

    // -------------------------------------------------------------------------
    // REFERENCE SET TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_reference_codes_deduplicate_across_rows() {
        let csv = "noticeId,naicsCode,state,popState\n\
                   R-1,541511,VA,MD\n\
                   R-2,541511.0,VA,TEX\n\
                   R-3,,XX,\n";
        let outcome = parse_contracts_csv(csv, None).unwrap();

        let mut naics: BTreeSet<&str> = BTreeSet::new();
        let mut states: BTreeSet<&str> = BTreeSet::new();
        for c in &outcome.contracts {
            if let Some(code) = c.naics_code.as_deref() {
                naics.insert(code);
            }
            for code in [c.state.as_deref(), c.pop_state.as_deref()] {
                if let Some(code) = code {
                    if valid_state_code(code) {
                        states.insert(code);
                    }
                }
            }
        }

        // Both NAICS spellings canonicalized to a single key
        assert_eq!(naics.into_iter().collect::<Vec<_>>(), vec!["541511"]);
        // "TEX" is 3 characters and never becomes a lookup row
        assert_eq!(
            states.into_iter().collect::<Vec<_>>(),
            vec!["MD", "VA", "XX"]
        );
    }
}
