//! SAT response page extraction
//!
//! The verification portal renders its verdict as a handful of loosely
//! structured tables whose order and headers are not stable. Instead of
//! walking fixed offsets, every `<tr>` is checked against a small table of
//! row rules. Each rule recognises one row shape by content and writes the
//! fields it owns. The issuer/receiver group keeps its first match; the
//! other groups take the last matching row.

use scraper::{ElementRef, Html, Selector};
use std::sync::OnceLock;

use crate::models::cfdi::{VerificationMethod, VerificationResult};

pub const ACTIVE_MARKER: &str = "Vigente";
pub const CANCELLED_MARKER: &str = "Cancelado";

const ACTIVE_MESSAGE: &str = "CFDI vigente - válido y activo";
const CANCELLED_MESSAGE: &str = "CFDI cancelado";
const NOT_FOUND_MESSAGE: &str = "CFDI no encontrado o inválido";

/// Row that a rule claimed but could not read.
#[derive(Debug, thiserror::Error)]
#[error("row {row}: {rule} rule expected cell {cell}")]
pub struct ExtractionAnomaly {
    pub row: usize,
    pub rule: &'static str,
    pub cell: usize,
}

struct RowRule {
    name: &'static str,
    /// Shape test on the trimmed cell texts.
    matches: fn(&[String]) -> bool,
    /// When true, later matching rows are ignored.
    claimed: fn(&VerificationResult) -> bool,
    apply: fn(&Row<'_>, &mut VerificationResult) -> Result<(), ExtractionAnomaly>,
}

struct Row<'a> {
    index: usize,
    rule: &'static str,
    cells: &'a [String],
}

impl Row<'_> {
    fn cell(&self, i: usize) -> Result<String, ExtractionAnomaly> {
        self.cells.get(i).cloned().ok_or(ExtractionAnomaly {
            row: self.index,
            rule: self.rule,
            cell: i,
        })
    }

    fn optional(&self, i: usize) -> String {
        self.cells.get(i).cloned().unwrap_or_default()
    }
}

const RULES: &[RowRule] = &[
    RowRule {
        name: "issuer_receiver",
        matches: |c| {
            let len = c[0].chars().count();
            c.len() >= 4 && (12..=13).contains(&len) && !c[0].starts_with("RFC")
        },
        claimed: |r| !r.issuer_rfc.is_empty(),
        apply: |row, r| {
            r.issuer_rfc = row.cell(0)?;
            r.issuer_name = row.cell(1)?;
            r.receiver_rfc = row.cell(2)?;
            r.receiver_name = row.cell(3)?;
            Ok(())
        },
    },
    RowRule {
        name: "document_metadata",
        matches: |c| c.len() >= 2 && c[0].contains('-') && c[1].contains('T'),
        claimed: |_| false,
        apply: |row, r| {
            r.uuid = row.cell(0)?;
            r.issued_at = row.cell(1)?;
            r.certified_at = row.optional(2);
            r.certifier = row.optional(3);
            Ok(())
        },
    },
    RowRule {
        name: "monetary_status",
        matches: |c| c.len() >= 3 && c[0].starts_with('$'),
        claimed: |_| false,
        apply: |row, r| {
            r.total = row.cell(0)?;
            r.effect = row.cell(1)?;
            r.status = row.cell(2)?;
            Ok(())
        },
    },
    RowRule {
        name: "cancellation",
        matches: |c| c.len() >= 2 && c[0].contains(CANCELLED_MARKER) && c[1].contains('T'),
        claimed: |_| false,
        apply: |row, r| {
            r.cancellation_status = row.cell(0)?;
            r.cancelled_at = row.cell(1)?;
            Ok(())
        },
    },
];

fn row_selector() -> &'static Selector {
    static SEL: OnceLock<Selector> = OnceLock::new();
    SEL.get_or_init(|| Selector::parse("table tr").expect("valid selector"))
}

fn cell_selector() -> &'static Selector {
    static SEL: OnceLock<Selector> = OnceLock::new();
    SEL.get_or_init(|| Selector::parse("td").expect("valid selector"))
}

/// Text of a cell with its text nodes joined and runs of whitespace
/// collapsed, so `Juan<br>Pérez` reads `Juan Pérez`.
fn cell_text(cell: ElementRef<'_>) -> String {
    cell.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// `<td>` texts of every table row in document order.
fn table_rows(document: &Html) -> Vec<Vec<String>> {
    document
        .select(row_selector())
        .map(|row| row.select(cell_selector()).map(cell_text).collect())
        .collect()
}

/// Extract a verification result from a rendered SAT response page.
///
/// Pure function of `markup`; never fails. Rows that match a rule but cannot
/// be read are logged and skipped, leaving the result partially populated.
pub fn extract(markup: &str, method: VerificationMethod) -> VerificationResult {
    let mut result = VerificationResult::default();

    if markup.contains(ACTIVE_MARKER) {
        result.valid = true;
        result.message = ACTIVE_MESSAGE.to_string();
    } else if markup.contains(CANCELLED_MARKER) {
        result.valid = true;
        result.message = CANCELLED_MESSAGE.to_string();
    } else {
        result.message = NOT_FOUND_MESSAGE.to_string();
    }

    let document = Html::parse_document(markup);

    for (index, cells) in table_rows(&document).iter().enumerate() {
        if cells.is_empty() {
            continue;
        }

        for rule in RULES {
            if (rule.claimed)(&result) || !(rule.matches)(cells) {
                continue;
            }
            let row = Row { index, rule: rule.name, cells };
            match (rule.apply)(&row, &mut result) {
                Ok(()) => tracing::debug!(row = index, rule = rule.name, "Row matched"),
                Err(anomaly) => {
                    tracing::warn!(%method, error = %anomaly, "Skipping unreadable row")
                }
            }
        }
    }

    result
}
