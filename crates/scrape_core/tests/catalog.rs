use pretty_assertions::assert_eq;
use scrape_core::{catalog, filter_records, FieldMatch, Record};
use serde_json::json;

fn record(value: serde_json::Value) -> Record {
    value.as_object().cloned().unwrap()
}

fn sample() -> Vec<Record> {
    vec![
        record(json!({"company_name": "Acme", "rating": "4.5"})),
        record(json!({"company_name": "Globex", "city": "Springfield"})),
        record(json!({"rating": "3.9", "Company-Name": "dup"})),
    ]
}

#[test]
fn available_fields_are_union_in_first_seen_order() {
    let cat = catalog(&sample(), &[]);
    assert_eq!(
        cat.available,
        vec!["company_name", "rating", "city", "Company-Name"]
    );
    assert!(cat.matched.is_empty());
    assert!(cat.unmatched.is_empty());
}

#[test]
fn tolerant_matching_ignores_case_and_punctuation() {
    let requested = vec!["Company Name".to_string(), "CITY".to_string()];
    let cat = catalog(&sample(), &requested);
    assert_eq!(
        cat.matched,
        vec![
            FieldMatch {
                requested: "Company Name".into(),
                field: "company_name".into()
            },
            FieldMatch {
                requested: "CITY".into(),
                field: "city".into()
            },
        ]
    );
    assert!(cat.unmatched.is_empty());
}

#[test]
fn unmatched_requests_are_reported_without_error() {
    let requested = vec!["N/A".to_string(), "---".to_string()];
    let cat = catalog(&sample(), &requested);
    assert!(cat.matched.is_empty());
    // Names without alphanumerics are skipped entirely.
    assert_eq!(cat.unmatched, vec!["N/A"]);
}

#[test]
fn filter_keeps_matched_fields_and_drops_empty_records() {
    let requested = vec!["city".to_string()];
    let cat = catalog(&sample(), &requested);
    let filtered = filter_records(sample(), &cat, &requested);
    assert_eq!(filtered, vec![record(json!({"city": "Springfield"}))]);
}

#[test]
fn empty_request_leaves_records_untouched() {
    let cat = catalog(&sample(), &[]);
    assert_eq!(filter_records(sample(), &cat, &[]), sample());

    let blank = vec!["  ".to_string()];
    let cat = catalog(&sample(), &blank);
    assert_eq!(filter_records(sample(), &cat, &blank), sample());
}

#[test]
fn no_match_filters_everything_out() {
    let requested = vec!["price".to_string()];
    let cat = catalog(&sample(), &requested);
    assert!(filter_records(sample(), &cat, &requested).is_empty());
    assert_eq!(cat.unmatched, vec!["price"]);
}
