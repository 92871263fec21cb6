use bson::{Bson, Document};
use std::cmp::Ordering;

use super::types::{CmpOp, Filter, MAX_PATH_DEPTH};

/// Evaluates a conjunction of clauses against a document.
#[must_use]
pub fn eval_all(doc: &Document, clauses: &[Filter], case_insensitive: bool) -> bool {
    clauses.iter().all(|f| eval_filter(doc, f, case_insensitive))
}

pub fn eval_filter(doc: &Document, filter: &Filter, case_insensitive: bool) -> bool {
    match filter {
        Filter::And(fs) => fs.iter().all(|f| eval_filter(doc, f, case_insensitive)),
        Filter::Or(fs) => fs.iter().any(|f| eval_filter(doc, f, case_insensitive)),
        Filter::In { path, values } => {
            get_path(doc, path).is_some_and(|v| is_in_set(v, values, case_insensitive))
        }
        Filter::Cmp { path, op, value } => {
            let Some(v) = get_path(doc, path) else {
                // Equality against null matches a missing field.
                return matches!(op, CmpOp::Eq) && matches!(value, Bson::Null);
            };
            if !same_family(v, value) {
                return false;
            }
            let ord = compare_bson(v, value, case_insensitive);
            match op {
                CmpOp::Eq => ord == Ordering::Equal,
                CmpOp::Gt => ord == Ordering::Greater,
                CmpOp::Gte => ord != Ordering::Less,
                CmpOp::Lt => ord == Ordering::Less,
                CmpOp::Lte => ord != Ordering::Greater,
            }
        }
    }
}

fn is_in_set(v: &Bson, set: &[Bson], case_insensitive: bool) -> bool {
    set.iter().any(|x| same_family(v, x) && compare_bson(v, x, case_insensitive) == Ordering::Equal)
}

pub(crate) fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    if path.is_empty() || path.len() > 1024 {
        return None;
    }
    let mut cur = doc;
    let mut segs = path.split('.').peekable();
    let mut depth = 0usize;
    while let Some(part) = segs.next() {
        depth += 1;
        if depth > MAX_PATH_DEPTH {
            return None;
        }
        let v = cur.get(part)?;
        if segs.peek().is_none() {
            return Some(v);
        }
        match v {
            Bson::Document(d) => cur = d,
            _ => return None,
        }
    }
    None
}

fn is_num(x: &Bson) -> bool {
    matches!(x, Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_))
}

#[allow(clippy::cast_precision_loss)]
fn as_f64_num(x: &Bson) -> f64 {
    match x {
        Bson::Int32(i) => f64::from(*i),
        Bson::Int64(i) => *i as f64,
        Bson::Double(f) => *f,
        Bson::Decimal128(d) => d.to_string().parse::<f64>().unwrap_or(f64::NAN),
        _ => f64::NAN,
    }
}

/// Range operators only match values of a comparable type, as in the store.
fn same_family(a: &Bson, b: &Bson) -> bool {
    (is_num(a) && is_num(b)) || type_rank(a) == type_rank(b)
}

pub fn compare_bson(a: &Bson, b: &Bson, case_insensitive: bool) -> Ordering {
    if is_num(a) && is_num(b) {
        return as_f64_num(a).total_cmp(&as_f64_num(b));
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) if case_insensitive => {
            x.to_lowercase().cmp(&y.to_lowercase())
        }
        (Bson::String(x), Bson::String(y)) => x.cmp(y),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::DateTime(x), Bson::DateTime(y)) => x.cmp(y),
        (Bson::Timestamp(x), Bson::Timestamp(y)) => {
            (x.time, x.increment).cmp(&(y.time, y.increment))
        }
        (Bson::Null, Bson::Null) => Ordering::Equal,
        _ if type_rank(a) == type_rank(b) => {
            if a == b { Ordering::Equal } else { Ordering::Less }
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn type_rank(v: &Bson) -> u8 {
    match v {
        Bson::MinKey => 0,
        Bson::Null | Bson::Undefined => 1,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 2,
        Bson::String(_) | Bson::Symbol(_) => 3,
        Bson::Document(_) => 4,
        Bson::Array(_) => 5,
        Bson::Binary(_) => 6,
        Bson::ObjectId(_) => 7,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        Bson::Timestamp(_) => 10,
        Bson::RegularExpression(_) => 11,
        Bson::DbPointer(_) => 12,
        Bson::JavaScriptCode(_) => 13,
        Bson::JavaScriptCodeWithScope(_) => 14,
        Bson::MaxKey => 255,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn nested_paths_and_ranges() {
        let d = doc! { "property": { "listing": { "price": { "list_price": 350_000.0 } } } };
        let gte = Filter::gte("property.listing.price.list_price", 300_000);
        let lte = Filter::lte("property.listing.price.list_price", 300_000);
        assert!(eval_filter(&d, &gte, false));
        assert!(!eval_filter(&d, &lte, false));
        assert!(!eval_filter(&d, &Filter::gte("property.missing", 1), false));
    }

    #[test]
    fn decimal_prices_compare_with_integer_bounds() {
        let price: bson::Decimal128 = "350000.50".parse().unwrap();
        let d = doc! { "list_price": Bson::Decimal128(price) };
        assert!(eval_filter(&d, &Filter::gte("list_price", 300_000), false));
        assert!(!eval_filter(&d, &Filter::lte("list_price", 300_000_i64), false));
        let lt = Filter::Cmp { path: "list_price".into(), op: CmpOp::Lt, value: Bson::Double(350_001.0) };
        assert!(eval_filter(&d, &lt, false));
    }

    #[test]
    fn case_insensitive_membership() {
        let d = doc! { "city": "Denver" };
        let f = Filter::In { path: "city".into(), values: vec!["denver".into(), "boulder".into()] };
        assert!(!eval_filter(&d, &f, false));
        assert!(eval_filter(&d, &f, true));
    }

    #[test]
    fn dates_compare_chronologically() {
        let early = bson::DateTime::from_millis(1_000);
        let late = bson::DateTime::from_millis(2_000);
        let d = doc! { "close_date": late };
        assert!(eval_filter(&d, &Filter::gte("close_date", early), false));
        assert!(!eval_filter(&d, &Filter::gte("close_date", "not a date"), false));
    }
}
