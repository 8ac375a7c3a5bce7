use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathInputs {
    pub home_dir: PathBuf,
    pub xdg_config_home: Option<PathBuf>,
    pub goodable_dir_override: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoodablePaths {
    pub base_dir: PathBuf,

    pub log_path: PathBuf,
    pub runtime_dir: PathBuf,
    pub projects_dir: PathBuf,

    pub config_dir: PathBuf,
    pub config_file: PathBuf,
    pub requests_file: PathBuf,
}

pub fn compute_paths(inputs: PathInputs) -> GoodablePaths {
    let base_dir = inputs
        .goodable_dir_override
        .clone()
        .unwrap_or_else(|| inputs.home_dir.join(".goodable"));

    let config_base = match inputs.goodable_dir_override {
        Some(ref override_dir) => override_dir.join("config"),
        None => inputs
            .xdg_config_home
            .unwrap_or_else(|| inputs.home_dir.join(".config"))
            .join("goodable"),
    };

    let runtime_dir = base_dir.join("runtime");

    GoodablePaths {
        log_path: base_dir.join("goodable.log"),
        requests_file: runtime_dir.join("requests.json"),
        runtime_dir,
        projects_dir: base_dir.join("projects"),

        config_file: config_base.join("config.toml"),

        base_dir,
        config_dir: config_base,
    }
}

#[derive(Debug, Error)]
pub enum SafeJoinError {
    #[error("path segment is empty")]
    Empty,
    #[error("path segment is not a normal component: {segment:?}")]
    NotNormal { segment: String },
}

/// Joins a single untrusted path segment (a project id, say) onto `base`.
pub fn safe_join(base: &Path, segment: &str) -> Result<PathBuf, SafeJoinError> {
    let segment = segment.trim();
    if segment.is_empty() {
        return Err(SafeJoinError::Empty);
    }

    let segment_path = Path::new(segment);
    if segment_path.is_absolute() {
        return Err(SafeJoinError::NotNormal {
            segment: segment.to_owned(),
        });
    }

    let mut components = segment_path.components();
    let first = components.next();
    let second = components.next();
    match (first, second) {
        (Some(std::path::Component::Normal(_)), None) => Ok(base.join(segment)),
        _ => Err(SafeJoinError::NotNormal {
            segment: segment.to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_paths_default() {
        let inputs = PathInputs {
            home_dir: PathBuf::from("/home/alice"),
            xdg_config_home: None,
            goodable_dir_override: None,
        };

        let got = compute_paths(inputs);
        assert_eq!(got.base_dir, PathBuf::from("/home/alice/.goodable"));
        assert_eq!(
            got.log_path,
            PathBuf::from("/home/alice/.goodable/goodable.log")
        );
        assert_eq!(
            got.requests_file,
            PathBuf::from("/home/alice/.goodable/runtime/requests.json")
        );
        assert_eq!(
            got.config_file,
            PathBuf::from("/home/alice/.config/goodable/config.toml")
        );
    }

    #[test]
    fn compute_paths_uses_xdg_config_home() {
        let inputs = PathInputs {
            home_dir: PathBuf::from("/home/alice"),
            xdg_config_home: Some(PathBuf::from("/tmp/xdg")),
            goodable_dir_override: None,
        };

        let got = compute_paths(inputs);
        assert_eq!(got.config_dir, PathBuf::from("/tmp/xdg/goodable"));
    }

    #[test]
    fn override_moves_everything_under_one_dir() {
        let inputs = PathInputs {
            home_dir: PathBuf::from("/home/alice"),
            xdg_config_home: Some(PathBuf::from("/tmp/xdg")),
            goodable_dir_override: Some(PathBuf::from("/tmp/goodable-dev")),
        };

        let got = compute_paths(inputs);
        assert_eq!(got.base_dir, PathBuf::from("/tmp/goodable-dev"));
        assert_eq!(got.config_dir, PathBuf::from("/tmp/goodable-dev/config"));
        assert_eq!(got.projects_dir, PathBuf::from("/tmp/goodable-dev/projects"));
    }

    #[test]
    fn safe_join_allows_single_normal_segment() {
        let got = safe_join(Path::new("/base"), "my-app").unwrap();
        assert_eq!(got, PathBuf::from("/base/my-app"));
    }

    #[test]
    fn safe_join_rejects_traversal_and_nesting() {
        let base = Path::new("/base");
        assert!(matches!(safe_join(base, " "), Err(SafeJoinError::Empty)));
        for bad in ["../evil", "a/b", "/abs", ".."] {
            assert!(
                matches!(safe_join(base, bad), Err(SafeJoinError::NotNormal { .. })),
                "{bad}"
            );
        }
    }
}
