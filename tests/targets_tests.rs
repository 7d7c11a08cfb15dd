use geo_scan_rs::policy::CountryPolicy;
use geo_scan_rs::targets::{
    load_exclude_list, load_include_list, load_targets_from_path, parse_targets_str,
};

#[test]
fn parse_names_comments_and_duplicates() {
    let input = r#"
        # nordic
        no1.example.com
        se2.example.com  # stockholm
        203.0.113.9
        no1.example.com  # duplicate
        # blank line follows

    "#;

    let names = parse_targets_str(input);
    assert_eq!(names, vec!["no1.example.com", "se2.example.com", "203.0.113.9"]);
}

#[test]
fn empty_target_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("servers.list");
    std::fs::write(&path, "\n\n   \n").unwrap();
    let err = load_targets_from_path(&path).unwrap_err();
    assert!(err.to_string().starts_with("no targets found in"));
}

#[test]
fn missing_target_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(load_targets_from_path(dir.path().join("servers.list")).is_err());
}

#[test]
fn missing_exclude_file_excludes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let list = load_exclude_list(dir.path().join("exclude_countries.list")).unwrap();
    assert!(list.is_empty());
}

#[test]
fn include_file_missing_or_absent_means_all() {
    let dir = tempfile::tempdir().unwrap();
    assert_eq!(load_include_list(None).unwrap(), None);
    let missing = dir.path().join("include.list");
    assert_eq!(load_include_list(Some(missing.as_path())).unwrap(), None);

    std::fs::write(&missing, "Japan, Korea\nTaiwan\n").unwrap();
    assert_eq!(
        load_include_list(Some(missing.as_path())).unwrap(),
        Some(vec!["Japan".to_string(), "Korea".to_string(), "Taiwan".to_string()])
    );
}

#[test]
fn blank_include_file_means_all() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("include.list");
    std::fs::write(&path, "\n\n").unwrap();
    let include = load_include_list(Some(path.as_path())).unwrap();
    assert_eq!(include, None);

    let policy = CountryPolicy::new(Some(Vec::<String>::new()), include);
    assert!(policy.allows("Germany"));
}
