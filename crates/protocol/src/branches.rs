use crate::Branch;

/// Renders branches as a comma-separated `name@version` list.
pub fn format_branches(branches: &[Branch]) -> String {
    branches
        .iter()
        .map(Branch::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Parses a comma-separated `name@version` list. Entries without a version
/// are rejected; blank entries are ignored.
pub fn parse_branches(raw: &str) -> Result<Vec<Branch>, String> {
    let mut out = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        // Branch names may contain '@' themselves; the commit never does.
        let Some((name, version)) = part.rsplit_once('@') else {
            return Err(format!("branch '{part}' is missing '@<commit>'"));
        };
        if name.is_empty() || version.is_empty() {
            return Err(format!("branch '{part}' has an empty name or commit"));
        }
        out.push(Branch::new(name, version));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_joins_with_commas() {
        let branches = vec![Branch::new("main", "abc"), Branch::new("dev", "def")];
        assert_eq!(format_branches(&branches), "main@abc,dev@def");
        assert_eq!(format_branches(&[]), "");
    }

    #[test]
    fn parse_accepts_formatted_output() {
        let parsed = parse_branches("main@abc, release@v1@123 ,").expect("parse");
        assert_eq!(
            parsed,
            vec![Branch::new("main", "abc"), Branch::new("release@v1", "123")]
        );
    }

    #[test]
    fn parse_rejects_missing_commit() {
        assert!(parse_branches("main").is_err());
        assert!(parse_branches("main@").is_err());
    }
}
