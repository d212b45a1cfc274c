//! NAICS Reference Importer - Loads the official 6-digit code/title
//! spreadsheet into the naics_codes lookup table
//!
//! Responsibilities:
//! - Read the reference workbook (whole first sheet)
//! - Locate the code/title/description columns by alias
//! - Canonicalize codes the same way the contracts importer does
//! - Upsert rows; the reference file is authoritative for titles
//!
//! The contracts importer creates placeholder lookup rows on the fly; this
//! job replaces those placeholders with the official titles.

use anyhow::{Context, Result};
use calamine::{open_workbook_auto, Data, Reader};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::path::Path;

#[derive(Parser, Debug)]
#[command(name = "naics", about = "Loads the NAICS reference spreadsheet into naics_codes")]
struct Args {
    /// Path to the reference spreadsheet (.xls or .xlsx)
    #[arg(long)]
    file: String,

    /// Read and report only - no database writes
    #[arg(long, default_value = "false")]
    dry_run: bool,
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
// SHEET PARSING
// =============================================================================
// Column headers vary by reference-file vintage ("2022 NAICS Code" in the
// current release). Aliases are tried in priority order, matched trimmed and
// case-insensitively.

const CODE_COLUMNS: &[&str] = &["2022 NAICS Code", "NAICS Code", "code"];
const TITLE_COLUMNS: &[&str] = &["2022 NAICS Title", "NAICS Title", "title"];
const DESCRIPTION_COLUMNS: &[&str] = &["2022 NAICS Description", "NAICS Description", "description"];

fn find_column(headers: &[String], candidates: &[&str]) -> Option<usize> {
    for candidate in candidates {
        for (idx, header) in headers.iter().enumerate() {
            if header.trim().eq_ignore_ascii_case(candidate) {
                return Some(idx);
            }
        }
    }
    None
}

/// Map blanks and sentinel spellings to None; trim everything else.
fn clean_value(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    for sentinel in ["NULL", "NONE", "N/A", "NA"] {
        if trimmed.eq_ignore_ascii_case(sentinel) {
            return None;
        }
    }
    Some(trimmed.to_string())
}

/// Same canonical form as the contracts importer: a value parsing as a
/// non-negative integral float renders as its pure digit string, so the
/// decimal-suffixed and plain spellings can never coexist as distinct keys.
fn canonicalize_naics(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Ok(value) = trimmed.parse::<f64>() {
        if value.is_finite() && value >= 0.0 && value.fract() == 0.0 && value < 1e15 {
            return format!("{}", value as u64);
        }
    }
    trimmed.to_string()
}

/// Code cells arrive as numbers in the official workbook; integral floats
/// must render without a decimal suffix.
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

#[derive(Debug, Clone)]
struct NaicsRow {
    code: String,
    title: String,
    description: Option<String>,
}

/// Read the whole first sheet and return the reference rows plus the count
/// of rows skipped for missing code or title.
fn parse_reference_sheet(path: &Path) -> Result<(Vec<NaicsRow>, usize)> {
    let mut workbook: calamine::Sheets<_> =
        open_workbook_auto(path).context("Failed to open reference spreadsheet")?;
    let sheet_names = workbook.sheet_names().to_vec();
    let sheet_name = sheet_names
        .first()
        .context("Reference spreadsheet has no sheets")?
        .clone();
    let range = workbook
        .worksheet_range(&sheet_name)
        .context("Failed to read sheet")?;

    let mut rows_iter = range.rows();
    let headers: Vec<String> = rows_iter
        .next()
        .context("Sheet has no header row")?
        .iter()
        .map(cell_to_string)
        .collect();

    let code_col = find_column(&headers, CODE_COLUMNS).with_context(|| {
        format!("No code column found. Expected one of: {}", CODE_COLUMNS.join(", "))
    })?;
    let title_col = find_column(&headers, TITLE_COLUMNS).with_context(|| {
        format!("No title column found. Expected one of: {}", TITLE_COLUMNS.join(", "))
    })?;
    let description_col = find_column(&headers, DESCRIPTION_COLUMNS);

    let mut rows = Vec::new();
    let mut skipped = 0usize;
    for row in rows_iter {
        let code = row.get(code_col).map(cell_to_string).and_then(|c| clean_value(&c));
        let title = row.get(title_col).map(cell_to_string).and_then(|t| clean_value(&t));
        let (code, title) = match (code, title) {
            (Some(code), Some(title)) => (code, title),
            _ => {
                skipped += 1;
                continue;
            }
        };
        let description = description_col
            .and_then(|col| row.get(col))
            .map(cell_to_string)
            .and_then(|d| clean_value(&d));
        rows.push(NaicsRow {
            code: canonicalize_naics(&code),
            title,
            description,
        });
    }

    Ok((rows, skipped))
}

// =============================================================================
// UPSERT
// =============================================================================

/// One transaction for the whole reference file. Titles always win over
/// whatever is in the table; a missing description never clobbers one that
/// is already there.
async fn upsert_codes(pool: &PgPool, rows: &[NaicsRow]) -> Result<usize> {
    let mut tx = pool.begin().await?;
    for row in rows {
        sqlx::query(
            r#"
            INSERT INTO naics_codes (code, title, description)
            VALUES ($1, $2, $3)
            ON CONFLICT (code) DO UPDATE
            SET title = EXCLUDED.title,
                description = COALESCE(EXCLUDED.description, naics_codes.description)
            "#,
        )
        .bind(&row.code)
        .bind(&row.title)
        .bind(&row.description)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(rows.len())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    println!("=== GovChime NAICS Reference Importer ===");
    println!("File: {}", args.file);
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

    let path = Path::new(&args.file);
    if !path.exists() {
        anyhow::bail!("Reference spreadsheet not found: {}", args.file);
    }

    let (rows, skipped) = parse_reference_sheet(path)?;
    println!("\nRead {} reference rows ({} skipped)", rows.len(), skipped);
    for (i, row) in rows.iter().take(3).enumerate() {
        println!("  [{}] {} - {}", i + 1, row.code, row.title);
    }
    if rows.len() > 3 {
        println!("  ... and {} more", rows.len() - 3);
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

    let imported = upsert_codes(&pool, &rows).await?;

    let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM naics_codes")
        .fetch_one(&pool)
        .await?;

    println!("\n=== NAICS Import Summary ===");
    println!("Codes upserted: {}", imported);
    println!("Rows skipped: {}", skipped);
    println!("Codes in database: {}", total);

    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
