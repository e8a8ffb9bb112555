use runnerctl_config::{load_images, load_machines, load_scripts};
use std::path::Path;

#[test]
fn load_valid_fixture() {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures");
    let images = load_images(&dir).expect("should load without error");
    assert!(!images.is_empty(), "expected at least one image");

    let img = &images[0];
    assert_eq!(img.id.as_str(), "ubuntu-22-04");
    assert_eq!(img.status, runnerctl_domain::ImageStatus::Active);

    let machines = load_machines(&dir).expect("should load machines");
    assert_eq!(machines.len(), 1);

    let scripts = load_scripts(&dir).expect("should load scripts");
    assert!(scripts
        .iter()
        .any(|s| s.event == runnerctl_domain::ScriptEvent::MetricsAgent));
    assert!(scripts
        .iter()
        .any(|s| s.event == runnerctl_domain::ScriptEvent::OnStartup));
}

#[test]
fn missing_dir_returns_error() {
    let dir = Path::new("/nonexistent/path/does/not/exist");
    assert!(load_images(dir).is_err());
}
