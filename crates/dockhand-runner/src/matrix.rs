// Matrix expansion: cross-product of the declared dimensions, exclude
// subtraction, include union, then the user-supplied filter.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{bail, Result};

/// One concrete binding of matrix dimensions to scalar values.
pub type MatrixPoint = BTreeMap<String, serde_json::Value>;

/// Canonical string form of a matrix value, used for the user filter's
/// set-membership check: integers print without decimals, booleans as
/// `true`/`false`, strings verbatim.
pub fn format_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                n.to_string()
            }
        }
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn yaml_to_json(value: &serde_yaml::Value) -> serde_json::Value {
    match value {
        serde_yaml::Value::Null => serde_json::Value::Null,
        serde_yaml::Value::Bool(b) => serde_json::Value::Bool(*b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                serde_json::Value::from(i)
            } else if let Some(u) = n.as_u64() {
                serde_json::Value::from(u)
            } else {
                serde_json::Value::from(n.as_f64().unwrap_or_default())
            }
        }
        serde_yaml::Value::String(s) => serde_json::Value::String(s.clone()),
        other => serde_json::Value::String(serde_yaml::to_string(other).unwrap_or_default()),
    }
}

type Entry = Vec<(String, serde_json::Value)>;

fn parse_entries(value: &serde_yaml::Value, what: &str) -> Result<Vec<Entry>> {
    let Some(sequence) = value.as_sequence() else {
        bail!("matrix {what} must be a sequence of mappings");
    };
    let mut entries = Vec::new();
    for item in sequence {
        let Some(mapping) = item.as_mapping() else {
            bail!("matrix {what} entries must be mappings");
        };
        let mut entry = Entry::new();
        for (key, val) in mapping {
            let Some(key) = key.as_str() else {
                bail!("matrix {what} keys must be strings");
            };
            entry.push((key.to_string(), yaml_to_json(val)));
        }
        entries.push(entry);
    }
    Ok(entries)
}

/// Expand a raw matrix node into concrete points.
///
/// The base cross-product iterates dimensions and their values in document
/// order, so the result is stable across runs with identical inputs.
/// `include` entries are applied in declaration order. An empty (or absent)
/// matrix yields exactly one synthetic point.
pub fn expand(raw: &serde_yaml::Value) -> Result<Vec<MatrixPoint>> {
    if raw.is_null() {
        return Ok(vec![MatrixPoint::new()]);
    }
    let Some(mapping) = raw.as_mapping() else {
        bail!("matrix must be a mapping");
    };

    let mut dimensions: Vec<(String, Vec<serde_json::Value>)> = Vec::new();
    let mut includes: Vec<Entry> = Vec::new();
    let mut excludes: Vec<Entry> = Vec::new();

    for (key, value) in mapping {
        let Some(key) = key.as_str() else {
            bail!("matrix dimension names must be strings");
        };
        match key {
            "include" => includes = parse_entries(value, "include")?,
            "exclude" => excludes = parse_entries(value, "exclude")?,
            _ => {
                let values = match value.as_sequence() {
                    Some(sequence) => sequence.iter().map(yaml_to_json).collect(),
                    None => vec![yaml_to_json(value)],
                };
                dimensions.push((key.to_string(), values));
            }
        }
    }

    let mut points: Vec<MatrixPoint> = if dimensions.is_empty() {
        Vec::new()
    } else {
        let mut acc = vec![MatrixPoint::new()];
        for (name, values) in &dimensions {
            let mut next = Vec::with_capacity(acc.len() * values.len());
            for point in &acc {
                for value in values {
                    let mut extended = point.clone();
                    extended.insert(name.clone(), value.clone());
                    next.push(extended);
                }
            }
            acc = next;
        }
        acc
    };

    points.retain(|point| {
        !excludes.iter().any(|entry| {
            entry
                .iter()
                .all(|(key, value)| point.get(key) == Some(value))
        })
    });

    let base_names: HashSet<&str> = dimensions.iter().map(|(name, _)| name.as_str()).collect();
    for entry in includes {
        if dimensions.is_empty() {
            points.push(entry.into_iter().collect());
            continue;
        }
        let base_keys: Vec<&(String, serde_json::Value)> = entry
            .iter()
            .filter(|(key, _)| base_names.contains(key.as_str()))
            .collect();
        if base_keys.is_empty() {
            // An include without base-dimension keys applies everywhere.
            for point in points.iter_mut() {
                for (key, value) in &entry {
                    point.insert(key.clone(), value.clone());
                }
            }
            continue;
        }
        let mut matched = false;
        for point in points.iter_mut() {
            if base_keys
                .iter()
                .all(|(key, value)| point.get(key) == Some(value))
            {
                for (key, value) in &entry {
                    point.insert(key.clone(), value.clone());
                }
                matched = true;
            }
        }
        if !matched {
            points.push(entry.into_iter().collect());
        }
    }

    if points.is_empty() {
        points.push(MatrixPoint::new());
    }
    Ok(points)
}

/// Keep only points whose values pass the user filter. Dimensions absent
/// from the filter are unconstrained; the check compares [`format_value`]
/// output against the allowed set.
pub fn apply_filter(
    points: Vec<MatrixPoint>,
    filter: &HashMap<String, HashSet<String>>,
) -> Vec<MatrixPoint> {
    points
        .into_iter()
        .filter(|point| {
            point.iter().all(|(key, value)| match filter.get(key) {
                Some(allowed) => allowed.contains(&format_value(value)),
                None => true,
            })
        })
        .collect()
}

/// Expand and filter in one step.
///
/// Without a filter the synthetic-point rule of [`expand`] applies; a filter
/// that empties a non-empty matrix yields nothing, fully skipping the job.
pub fn select(
    raw: &serde_yaml::Value,
    filter: &HashMap<String, HashSet<String>>,
) -> Result<Vec<MatrixPoint>> {
    let points = expand(raw)?;
    if filter.is_empty() {
        return Ok(points);
    }
    Ok(apply_filter(points, filter))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(yaml: &str) -> serde_yaml::Value {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn filter(pairs: &[(&str, &[&str])]) -> HashMap<String, HashSet<String>> {
        pairs
            .iter()
            .map(|(key, values)| {
                (
                    key.to_string(),
                    values.iter().map(|v| v.to_string()).collect(),
                )
            })
            .collect()
    }

    fn values(points: &[MatrixPoint], key: &str) -> Vec<String> {
        points
            .iter()
            .map(|p| format_value(p.get(key).unwrap_or(&serde_json::Value::Null)))
            .collect()
    }

    #[test]
    fn test_cross_product_in_document_order() {
        let points = expand(&raw("{os: [linux, windows], node: [18, 20]}")).unwrap();
        assert_eq!(points.len(), 4);
        assert_eq!(values(&points, "os"), vec!["linux", "linux", "windows", "windows"]);
        assert_eq!(values(&points, "node"), vec!["18", "20", "18", "20"]);
    }

    #[test]
    fn test_expansion_is_stable() {
        let node = raw("{os: [a, b], arch: [x, y]}");
        assert_eq!(expand(&node).unwrap(), expand(&node).unwrap());
    }

    #[test]
    fn test_empty_matrix_yields_one_synthetic_point() {
        assert_eq!(expand(&serde_yaml::Value::Null).unwrap(), vec![MatrixPoint::new()]);
        assert_eq!(expand(&raw("{}")).unwrap(), vec![MatrixPoint::new()]);
    }

    #[test]
    fn test_exclude_removes_matching_points() {
        let points = expand(&raw(
            "{os: [linux, windows], node: [18, 20], exclude: [{os: windows, node: 18}]}",
        ))
        .unwrap();
        assert_eq!(points.len(), 3);
        assert!(!points.iter().any(|p| {
            format_value(&p["os"]) == "windows" && format_value(&p["node"]) == "18"
        }));
    }

    #[test]
    fn test_include_augments_matching_points() {
        let points = expand(&raw(
            "{os: [linux, windows], include: [{os: windows, shell: pwsh}]}",
        ))
        .unwrap();
        assert_eq!(points.len(), 2);
        let windows = points
            .iter()
            .find(|p| format_value(&p["os"]) == "windows")
            .unwrap();
        assert_eq!(format_value(&windows["shell"]), "pwsh");
        let linux = points
            .iter()
            .find(|p| format_value(&p["os"]) == "linux")
            .unwrap();
        assert!(!linux.contains_key("shell"));
    }

    #[test]
    fn test_include_with_novel_value_appends() {
        let points = expand(&raw("{os: [linux], include: [{os: plan9}]}")).unwrap();
        assert_eq!(values(&points, "os"), vec!["linux", "plan9"]);
    }

    #[test]
    fn test_include_without_base_keys_applies_everywhere() {
        let points = expand(&raw("{os: [linux, windows], include: [{color: green}]}")).unwrap();
        assert_eq!(points.len(), 2);
        assert!(points.iter().all(|p| format_value(&p["color"]) == "green"));
    }

    #[test]
    fn test_include_only_matrix() {
        let points = expand(&raw("include: [{a: 1}, {b: 2}]")).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(format_value(&points[0]["a"]), "1");
        assert_eq!(format_value(&points[1]["b"]), "2");
    }

    #[test]
    fn test_filter_keeps_allowed_values_only() {
        let node = raw("{os: [a, b, c]}");
        let points = select(&node, &filter(&[("os", &["a", "c"])])).unwrap();
        assert_eq!(values(&points, "os"), vec!["a", "c"]);
    }

    #[test]
    fn test_filter_is_monotone() {
        let node = raw("{os: [a, b], node: [18, 20]}");
        let unfiltered = select(&node, &HashMap::new()).unwrap();
        let filtered = select(&node, &filter(&[("os", &["a"])])).unwrap();
        assert!(filtered.iter().all(|p| unfiltered.contains(p)));
        assert_eq!(unfiltered, expand(&node).unwrap());
    }

    #[test]
    fn test_filter_that_empties_yields_nothing() {
        let node = raw("{os: [a, b]}");
        let points = select(&node, &filter(&[("os", &["zzz"])])).unwrap();
        assert!(points.is_empty());
    }

    #[test]
    fn test_filter_matches_numbers_by_canonical_form() {
        let node = raw("{node: [18, 20]}");
        let points = select(&node, &filter(&[("node", &["20"])])).unwrap();
        assert_eq!(values(&points, "node"), vec!["20"]);
    }

    #[test]
    fn test_synthetic_point_passes_any_filter() {
        // A job with no matrix is unconstrained by a filter on other jobs'
        // dimensions.
        let points = select(&serde_yaml::Value::Null, &filter(&[("os", &["a"])])).unwrap();
        assert_eq!(points.len(), 1);
    }

    #[test]
    fn test_format_value_canonical_forms() {
        assert_eq!(format_value(&serde_json::json!(20)), "20");
        assert_eq!(format_value(&serde_json::json!(true)), "true");
        assert_eq!(format_value(&serde_json::json!(false)), "false");
        assert_eq!(format_value(&serde_json::json!("plain")), "plain");
        assert_eq!(format_value(&serde_json::json!(3.5)), "3.5");
    }

    #[test]
    fn test_non_mapping_matrix_is_an_error() {
        assert!(expand(&raw("[1, 2]")).is_err());
    }
}
