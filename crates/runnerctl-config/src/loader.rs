use std::path::Path;

use runnerctl_domain::{
    CloudConnectorId, Image, ImageId, ImageStatus, Machine, MachineId, Script, ScriptEvent,
};
use tracing::debug;

use crate::error::ConfigError;
use crate::raw::RawImage;

/// Walk `dir` and load every image found.
///
/// Expected directory layout:
/// ```text
/// <dir>/
///   <image-id>/
///     config.yml              <- RawImage
///     scripts/
///       on_startup.sh          (optional)
///       on_awaiting_client.sh  (optional)
///       on_terminate.sh        (optional)
///   metrics_agent.sh           <- mandatory, applies to every image
/// ```
pub fn load_images(dir: &Path) -> Result<Vec<Image>, ConfigError> {
    let mut images = Vec::new();
    for entry in read_dir(dir)? {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let config_path = path.join("config.yml");
        if !config_path.exists() {
            continue;
        }
        images.push(load_one_image(&path, &config_path)?);
    }
    Ok(images)
}

fn load_one_image(image_dir: &Path, config_path: &Path) -> Result<Image, ConfigError> {
    let content = read_to_string(config_path)?;
    let raw: RawImage = serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlParse {
        path: config_path.display().to_string(),
        source: e,
    })?;

    let id = image_dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ConfigError::Conversion {
            path: config_path.display().to_string(),
            message: "image directory name is not valid UTF-8".into(),
        })?;

    let status = parse_image_status(&raw.status, config_path)?;
    debug!(image_id = id, status = %raw.status, "loading image config");

    Ok(Image {
        id: ImageId::new(id),
        identifier: raw.identifier,
        machine_id: MachineId::new(&raw.machine.id),
        cloud_connector_id: CloudConnectorId::new(raw.cloud_connector_id),
        pool_size: raw.pool_size,
        status,
        tags: raw.tags,
    })
}

/// Load the machine-type metadata embedded in each image's `config.yml`,
/// deduplicated by machine id.
pub fn load_machines(dir: &Path) -> Result<Vec<Machine>, ConfigError> {
    let mut machines: Vec<Machine> = Vec::new();
    for entry in read_dir(dir)? {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let config_path = path.join("config.yml");
        if !config_path.exists() {
            continue;
        }
        let content = read_to_string(&config_path)?;
        let raw: RawImage = serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlParse {
            path: config_path.display().to_string(),
            source: e,
        })?;
        let id = MachineId::new(&raw.machine.id);
        if machines.iter().any(|m: &Machine| m.id == id) {
            continue;
        }
        machines.push(Machine {
            id,
            identifier: raw.machine.identifier,
            vcpu: raw.machine.vcpu,
            memory_mb: raw.machine.memory_mb,
        });
    }
    Ok(machines)
}

/// Load per-image bootstrap/shutdown scripts plus the one mandatory,
/// image-independent metrics-agent script (§4.2 stage 4).
pub fn load_scripts(dir: &Path) -> Result<Vec<Script>, ConfigError> {
    let mut scripts = Vec::new();

    for entry in read_dir(dir)? {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let config_path = path.join("config.yml");
        if !config_path.exists() {
            continue;
        }
        let image_id = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ConfigError::Conversion {
                path: path.display().to_string(),
                message: "image directory name is not valid UTF-8".into(),
            })?;

        let scripts_dir = path.join("scripts");
        for (file_name, event) in [
            ("on_startup.sh", ScriptEvent::OnStartup),
            ("on_awaiting_client.sh", ScriptEvent::OnAwaitingClient),
            ("on_terminate.sh", ScriptEvent::OnTerminate),
            ("on_connect.sh", ScriptEvent::OnConnect),
            ("on_disconnect.sh", ScriptEvent::OnDisconnect),
        ] {
            let script_path = scripts_dir.join(file_name);
            if !script_path.exists() {
                continue;
            }
            let body = read_to_string(&script_path)?;
            scripts.push(Script {
                id: uuid::Uuid::new_v4(),
                image_id: Some(ImageId::new(image_id)),
                event,
                template_body: body,
            });
        }
    }

    let metrics_path = dir.join("metrics_agent.sh");
    let metrics_body = read_to_string(&metrics_path)?;
    scripts.push(Script {
        id: uuid::Uuid::new_v4(),
        image_id: None,
        event: ScriptEvent::MetricsAgent,
        template_body: metrics_body,
    });

    Ok(scripts)
}

fn parse_image_status(s: &str, path: &Path) -> Result<ImageStatus, ConfigError> {
    match s {
        "creating" => Ok(ImageStatus::Creating),
        "active" => Ok(ImageStatus::Active),
        "inactive" => Ok(ImageStatus::Inactive),
        "deleted" => Ok(ImageStatus::Deleted),
        other => Err(ConfigError::Conversion {
            path: path.display().to_string(),
            message: format!("unknown image status '{}'", other),
        }),
    }
}

fn read_dir(dir: &Path) -> Result<Vec<std::fs::DirEntry>, ConfigError> {
    let entries = std::fs::read_dir(dir).map_err(|e| ConfigError::Io {
        path: dir.display().to_string(),
        source: e,
    })?;
    entries
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::Io {
            path: dir.display().to_string(),
            source: e,
        })
}

fn read_to_string(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    #[test]
    fn loads_image_with_machine_and_scripts() {
        let tmp = tempfile::tempdir().unwrap();
        let images_dir = tmp.path();
        write_file(
            &images_dir.join("ubuntu-22-04/config.yml"),
            "identifier: ami-0123456789\n\
             machine:\n  id: m-medium\n  identifier: t3.medium\n  vcpu: 2\n  memory_mb: 4096\n\
             cloud_connector_id: conn-1\n\
             pool_size: 3\n\
             status: active\n\
             tags: [dev, gpu]\n",
        );
        write_file(
            &images_dir.join("ubuntu-22-04/scripts/on_startup.sh"),
            "#!/bin/bash\necho hi {{name}}\n",
        );
        write_file(&images_dir.join("metrics_agent.sh"), "#!/bin/bash\nnode_exporter\n");

        let images = load_images(images_dir).unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].pool_size, 3);
        assert_eq!(images[0].status, ImageStatus::Active);

        let machines = load_machines(images_dir).unwrap();
        assert_eq!(machines.len(), 1);
        assert_eq!(machines[0].identifier, "t3.medium");

        let scripts = load_scripts(images_dir).unwrap();
        assert!(scripts
            .iter()
            .any(|s| s.event == ScriptEvent::OnStartup && s.image_id.is_some()));
        assert!(scripts
            .iter()
            .any(|s| s.event == ScriptEvent::MetricsAgent && s.image_id.is_none()));
    }

    #[test]
    fn missing_dir_returns_error() {
        let dir = Path::new("/nonexistent/path/does/not/exist");
        assert!(load_images(dir).is_err());
    }
}
