pub mod extract;
pub mod nodes;

use chrono::{DateTime, Utc};

use crate::db::CompanyRecord;

/// Markup → typed tree → labelled fields. `None` when nothing was recognised.
pub fn transform(raw_html: &str, idno: &str) -> Option<CompanyRecord> {
    transform_at(raw_html, idno, Utc::now())
}

pub fn transform_at(raw_html: &str, idno: &str, scraped_at: DateTime<Utc>) -> Option<CompanyRecord> {
    if raw_html.trim().is_empty() {
        return None;
    }
    let doc = nodes::parse_document(raw_html);
    let texts: Vec<String> = doc.text_nodes().filter_map(nodes::normalize).collect();
    let field = |rule: &extract::LabelRule| {
        extract::scan_labelled(texts.iter().map(String::as_str), rule)
    };

    let record = CompanyRecord {
        idno: idno.to_string(),
        company_name: extract::company_name(&doc),
        address: field(&extract::ADDRESS),
        legal_form: field(&extract::LEGAL_FORM),
        registered_on: field(&extract::REGISTERED_ON),
        scraped_at,
    };

    let found_any = record.company_name.is_some()
        || record.address.is_some()
        || record.legal_form.is_some()
        || record.registered_on.is_some();
    found_any.then_some(record)
}

// ── Tests ──
