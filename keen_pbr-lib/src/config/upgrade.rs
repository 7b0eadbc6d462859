//! Migration of legacy configuration shapes into the current schema.
//!
//! Operates on the raw [`toml::Table`] before typed deserialization so that
//! removed legacy keys never need representation in the typed model. Running
//! the migration twice yields no further changes.

use toml::{Table, Value};

pub(crate) fn apply(table: &mut Table) -> bool {
    let mut changed = false;
    let mut generated_lists: Vec<Value> = Vec::new();
    let existing_list_names = list_names(table);

    if let Some(Value::Array(ipsets)) = table.get_mut("ipset") {
        for entry in ipsets.iter_mut() {
            let Some(ipset) = entry.as_table_mut() else { continue };
            changed |= promote_ip_version(ipset);
            changed |= singular_interface(ipset);
            if let Some(list) = inline_hosts(ipset, &existing_list_names) {
                generated_lists.push(list);
                changed = true;
            }
        }
    }

    if !generated_lists.is_empty() {
        match table.get_mut("list") {
            Some(Value::Array(lists)) => lists.extend(generated_lists),
            _ => {
                table.insert("list".to_string(), Value::Array(generated_lists));
            }
        }
    }

    if let Some(Value::Array(lists)) = table.get_mut("list") {
        for entry in lists.iter_mut() {
            let Some(list) = entry.as_table_mut() else { continue };
            changed |= legacy_list_name(list);
        }
    }

    changed
}

fn list_names(table: &Table) -> Vec<String> {
    let Some(Value::Array(lists)) = table.get("list") else {
        return Vec::new();
    };
    lists
        .iter()
        .filter_map(|entry| entry.as_table())
        .filter_map(|list| {
            list.get("list_name")
                .or_else(|| list.get("name"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        })
        .collect()
}

/// `ip_version` unset or 0 becomes 4.
fn promote_ip_version(ipset: &mut Table) -> bool {
    match ipset.get("ip_version").and_then(Value::as_integer) {
        None | Some(0) => {
            ipset.insert("ip_version".to_string(), Value::Integer(4));
            true
        }
        Some(_) => false,
    }
}

/// Singular `routing.interface` becomes the `interfaces` list.
fn singular_interface(ipset: &mut Table) -> bool {
    let Some(routing) = ipset.get_mut("routing").and_then(Value::as_table_mut) else {
        return false;
    };
    let Some(singular) = routing.remove("interface") else {
        return false;
    };
    let already_listed = matches!(routing.get("interfaces"), Some(Value::Array(a)) if !a.is_empty());
    if !already_listed && let Some(name) = singular.as_str() {
        routing.insert("interfaces".to_string(), Value::Array(vec![Value::String(name.to_string())]));
    }
    true
}

/// A per-ipset inline `hosts` array becomes a global `[[list]]` referenced by name.
fn inline_hosts(ipset: &mut Table, existing_list_names: &[String]) -> Option<Value> {
    let hosts = ipset.remove("hosts")?;

    let base = ipset
        .get("ipset_name")
        .and_then(Value::as_str)
        .unwrap_or("migrated")
        .to_string();
    let list_name = if existing_list_names.contains(&base) {
        format!("{base}_hosts")
    } else {
        base
    };

    match ipset.get_mut("lists") {
        Some(Value::Array(lists)) => lists.push(Value::String(list_name.clone())),
        _ => {
            ipset.insert(
                "lists".to_string(),
                Value::Array(vec![Value::String(list_name.clone())]),
            );
        }
    }

    let mut list = Table::new();
    list.insert("list_name".to_string(), Value::String(list_name));
    list.insert("hosts".to_string(), hosts);
    Some(Value::Table(list))
}

/// The legacy `name` key of a list becomes `list_name`.
fn legacy_list_name(list: &mut Table) -> bool {
    if list.contains_key("list_name") {
        return false;
    }
    let Some(name) = list.remove("name") else {
        return false;
    };
    list.insert("list_name".to_string(), name);
    true
}
