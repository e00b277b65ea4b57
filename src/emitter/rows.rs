use crate::config::Category;
use crate::osc::{ChangeRecord, Element};

fn opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Node, way or relation row, depending on the record's element.
pub fn entity_row(record: &ChangeRecord) -> Vec<String> {
    let category = match record.element {
        Element::Node { .. } => Category::Nodes,
        Element::Way { .. } => Category::Ways,
        Element::Relation { .. } => Category::Relations,
    };
    let mut row = vec![
        category.row_kind().to_string(),
        record.action.as_str().to_string(),
        record.epoch_millis().to_string(),
        record.id.to_string(),
        record.version.to_string(),
        opt(record.changeset),
        record.user.clone().unwrap_or_default(),
        opt(record.uid),
    ];
    match &record.element {
        Element::Node { lat, lon } => {
            row.push(opt(*lat));
            row.push(opt(*lon));
        }
        Element::Way { node_refs } => {
            let refs: Vec<String> = node_refs.iter().map(i64::to_string).collect();
            row.push(refs.join(" "));
        }
        Element::Relation { members } => {
            row.push(members.len().to_string());
        }
    }
    row
}

/// One row per relation member, in member order. Empty for nodes and ways.
pub fn member_rows(record: &ChangeRecord) -> Vec<Vec<String>> {
    let Element::Relation { members } = &record.element else {
        return Vec::new();
    };
    members
        .iter()
        .enumerate()
        .map(|(position, member)| {
            vec![
                Category::Members.row_kind().to_string(),
                record.id.to_string(),
                position.to_string(),
                member.member_type.as_str().to_string(),
                member.id.to_string(),
                member.role.clone(),
            ]
        })
        .collect()
}

/// One row per tag, sorted by key.
pub fn tag_rows(record: &ChangeRecord) -> Vec<Vec<String>> {
    let epoch_millis = record.epoch_millis().to_string();
    record
        .tags
        .iter()
        .map(|(key, value)| {
            vec![
                Category::Tags.row_kind().to_string(),
                epoch_millis.clone(),
                record.element_type().as_str().to_string(),
                record.id.to_string(),
                key.clone(),
                value.clone(),
            ]
        })
        .collect()
}
