use bson::{Bson, Document, doc};

use super::types::{CmpOp, Filter};

/// Renders one clause into store query syntax.
#[must_use]
pub fn render_filter(filter: &Filter) -> Document {
    match filter {
        Filter::And(fs) => doc! { "$and": fs.iter().map(|f| Bson::Document(render_filter(f))).collect::<Vec<_>>() },
        Filter::Or(fs) => doc! { "$or": fs.iter().map(|f| Bson::Document(render_filter(f))).collect::<Vec<_>>() },
        Filter::In { path, values } => {
            let mut d = Document::new();
            d.insert(path.clone(), doc! { "$in": values.clone() });
            d
        }
        Filter::Cmp { path, op: CmpOp::Eq, value } => {
            let mut d = Document::new();
            d.insert(path.clone(), value.clone());
            d
        }
        Filter::Cmp { path, op, value } => {
            let mut inner = Document::new();
            inner.insert(op.operator(), value.clone());
            let mut d = Document::new();
            d.insert(path.clone(), inner);
            d
        }
    }
}

fn is_operator_doc(v: &Bson) -> Option<&Document> {
    match v {
        Bson::Document(d) if !d.is_empty() && d.keys().all(|k| k.starts_with('$')) => Some(d),
        _ => None,
    }
}

/// Renders an ordered conjunction into a single query document.
///
/// Range bounds on the same field merge into one operator document
/// (`{"price": {"$gte": a, "$lte": b}}`); any other repeated key is moved under
/// `$and` so no clause is silently overwritten.
#[must_use]
pub fn to_query_document(clauses: &[Filter]) -> Document {
    let mut out = Document::new();
    let mut overflow: Vec<Bson> = Vec::new();
    for clause in clauses {
        for (key, value) in render_filter(clause) {
            let merged = match (out.get(&key).and_then(is_operator_doc), is_operator_doc(&value)) {
                (Some(existing), Some(incoming))
                    if incoming.keys().all(|k| !existing.contains_key(k)) =>
                {
                    let mut m = existing.clone();
                    m.extend(incoming.clone());
                    Some(m)
                }
                _ => None,
            };
            if let Some(m) = merged {
                out.insert(key, m);
            } else if out.contains_key(&key) {
                let mut single = Document::new();
                single.insert(key, value);
                overflow.push(Bson::Document(single));
            } else {
                out.insert(key, value);
            }
        }
    }
    if !overflow.is_empty() {
        match out.get_mut("$and") {
            Some(Bson::Array(existing)) => existing.extend(overflow),
            _ => {
                out.insert("$and", overflow);
            }
        }
    }
    out
}

/// A `$match` stage over the conjunction of `clauses`.
#[must_use]
pub fn match_stage(clauses: &[Filter]) -> Document {
    let rendered: Vec<Bson> = clauses.iter().map(|c| Bson::Document(render_filter(c))).collect();
    if rendered.is_empty() {
        doc! { "$match": {} }
    } else {
        doc! { "$match": { "$and": rendered } }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_bounds_merge_on_one_field() {
        let q = to_query_document(&[
            Filter::eq("source_system_key", "SOLO"),
            Filter::gte("price", 100),
            Filter::lte("price", 500),
        ]);
        assert_eq!(q, doc! { "source_system_key": "SOLO", "price": { "$gte": 100, "$lte": 500 } });
    }

    #[test]
    fn repeated_equality_moves_under_and() {
        let q = to_query_document(&[Filter::eq("city", "Austin"), Filter::eq("city", "Dallas")]);
        assert_eq!(q, doc! { "city": "Austin", "$and": [ { "city": "Dallas" } ] });
    }

    #[test]
    fn empty_conjunction_matches_all() {
        assert!(to_query_document(&[]).is_empty());
        assert_eq!(match_stage(&[]), doc! { "$match": {} });
    }
}
