use crate::config::Config;
use crate::error::PrerequisiteMissing;
use common::migrations::SCHEMA_VERSION;
use common::JobStore;
use std::path::Path;
use std::time::Duration;

/// Everything that must hold before the first runner is launched.
pub fn check(config: &Config) -> Result<(), PrerequisiteMissing> {
    check_store(&config.store.path, config.lock_timeout())?;
    for path in &config.prerequisites {
        if !path.exists() {
            return Err(PrerequisiteMissing::PathAbsent(path.clone()));
        }
    }
    Ok(())
}

/// The job store exists and its schema is current.
pub fn check_store(path: &Path, lock_timeout: Duration) -> Result<(), PrerequisiteMissing> {
    if !path.exists() {
        return Err(PrerequisiteMissing::StoreAbsent(path.to_path_buf()));
    }

    let unreadable = |source| PrerequisiteMissing::StoreUnreadable {
        path: path.to_path_buf(),
        source,
    };
    let store = JobStore::open(path, lock_timeout).map_err(unreadable)?;
    let found = store.schema_version().map_err(unreadable)?;
    if found != SCHEMA_VERSION {
        return Err(PrerequisiteMissing::StoreNotInitialized {
            path: path.to_path_buf(),
            found,
            expected: SCHEMA_VERSION,
        });
    }
    Ok(())
}

/// What the operator should do about it.
pub fn remedy(err: &PrerequisiteMissing) -> &'static str {
    match err {
        PrerequisiteMissing::StoreAbsent(_) | PrerequisiteMissing::StoreNotInitialized { .. } => {
            "database not up-to-date, please run `portalctl init` first"
        }
        PrerequisiteMissing::StoreUnreadable { .. } => "check the job store's permissions and integrity",
        PrerequisiteMissing::PathAbsent(_) => "create the missing file or remove it from `prerequisites`",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn config_for(dir: &TempDir, extra: &[&str]) -> Config {
        let yaml = format!(
            "store:\n  path: {}\nprerequisites: [{}]\nservices:\n  web: {{program: gunicorn}}\n  search: {{program: python}}\n  download: {{program: python}}\n",
            dir.path().join("queries.db").display(),
            extra.join(", ")
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    #[test]
    fn test_absent_store() {
        let dir = TempDir::new().unwrap();
        let err = check(&config_for(&dir, &[])).unwrap_err();
        assert!(matches!(err, PrerequisiteMissing::StoreAbsent(_)));
        assert!(remedy(&err).contains("portalctl init"));
        // The check never creates the store as a side effect.
        assert!(!dir.path().join("queries.db").exists());
    }

    #[test]
    fn test_uninitialized_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queries.db");
        std::fs::File::create(&path).unwrap();

        let err = check_store(&path, TIMEOUT).unwrap_err();
        assert!(matches!(
            err,
            PrerequisiteMissing::StoreNotInitialized { found: 0, expected: SCHEMA_VERSION, .. }
        ));
    }

    #[test]
    fn test_initialized_store() {
        let dir = TempDir::new().unwrap();
        JobStore::create(dir.path().join("queries.db"), TIMEOUT).unwrap();
        assert!(check(&config_for(&dir, &[])).is_ok());
    }

    #[test]
    fn test_extra_prerequisite() {
        let dir = TempDir::new().unwrap();
        JobStore::create(dir.path().join("queries.db"), TIMEOUT).unwrap();
        let accounts = dir.path().join("accounts.db");
        let config = config_for(&dir, &[accounts.to_str().unwrap()]);

        assert!(matches!(check(&config), Err(PrerequisiteMissing::PathAbsent(_))));

        std::fs::File::create(&accounts).unwrap();
        assert!(check(&config).is_ok());
    }
}
