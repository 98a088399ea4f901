//! Backend URL composition from a target base and the inbound path/query.

/// Joins `target` with the inbound `path` and `query`.
///
/// Absolute targets (`http://…`, `https://…`) are used as-is. Any other target
/// is treated as a path on the inbound `host`. A query carried by the target is
/// kept and the inbound query is appended after it with `&`.
#[must_use]
pub fn join_url_path(target: &str, host: &str, path: &str, query: Option<&str>) -> String {
    let target = if target.starts_with("http") {
        target.to_string()
    } else if target.starts_with('/') {
        format!("{host}{target}")
    } else {
        format!("{host}/{target}")
    };

    let (base, target_query) = match target.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (target.as_str(), None),
    };

    let a_slash = path.starts_with('/');
    let b_slash = base.ends_with('/');

    let mut joined = String::with_capacity(target.len() + path.len() + query.map_or(0, str::len) + 2);
    joined.push_str(base);
    match (a_slash, b_slash) {
        (true, true) => joined.push_str(&path[1..]),
        (false, false) => {
            joined.push('/');
            joined.push_str(path);
        }
        _ => joined.push_str(path),
    }

    if let Some(target_query) = target_query {
        joined.push('?');
        joined.push_str(target_query);
    }
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        joined.push(if target_query.is_some() { '&' } else { '?' });
        joined.push_str(query);
    }
    joined
}
