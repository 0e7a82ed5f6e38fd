//! Descriptor resolution tests

use async_trait::async_trait;
use koram::app::options::AppOptions;
use koram::app::run::run_init;
use koram::config::loader::{resolve_config, ConfigLoader, Overrides};
use koram::credentials::{CredentialProvider, CredentialQuery, Credentials};
use koram::errors::DeployError;
use secrecy::SecretString;

/// Answers every `(user, host)` query for one server
struct StaticProvider;

#[async_trait]
impl CredentialProvider for StaticProvider {
    async fn resolve(&self, query: &CredentialQuery) -> Result<Option<Credentials>, DeployError> {
        if query.alias.as_deref() == Some("shop-prod") || query.host.as_deref() == Some("10.0.0.5")
        {
            return Ok(Some(Credentials {
                alias: Some("shop-prod".to_string()),
                user: "deploy".to_string(),
                host: "10.0.0.5".to_string(),
                password: Some(SecretString::from("s3cret".to_string())),
            }));
        }
        Ok(None)
    }
}

fn write_descriptor(dir: &tempfile::TempDir, env: &str, body: &str) {
    std::fs::write(dir.path().join(format!(".koram-rc.{}.json", env)), body).unwrap();
}

#[tokio::test]
async fn test_descriptor_password_is_overlaid_from_store() {
    let dir = tempfile::tempdir().unwrap();
    write_descriptor(
        &dir,
        "production",
        r#"{"name":"shop","server":{"host":"10.0.0.5","user":"deploy"},"deploy":{"path":"/srv/app"}}"#,
    );

    let (env, config) = resolve_config(
        &ConfigLoader::new(dir.path()),
        None,
        &StaticProvider,
        &Overrides::default(),
    )
    .await
    .unwrap();

    assert_eq!(env, "production");
    assert_eq!(config.server.secret(), Some("s3cret"));
    assert_eq!(config.environment.as_deref(), Some("production"));
}

#[tokio::test]
async fn test_unknown_alias_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    write_descriptor(&dir, "production", r#"{"deploy":{"path":"/srv/app"}}"#);
    let overrides = Overrides {
        alias: Some("nope".to_string()),
        ..Default::default()
    };

    let err = resolve_config(&ConfigLoader::new(dir.path()), None, &StaticProvider, &overrides)
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::CredentialError(ref m) if m.contains("nope")));
}

#[tokio::test]
async fn test_overrides_win_and_are_validated() {
    let dir = tempfile::tempdir().unwrap();
    write_descriptor(
        &dir,
        "staging",
        r#"{"server":{"host":"old.example.com","user":"root"},"deploy":{"path":"/srv/app"}}"#,
    );
    let loader = ConfigLoader::new(dir.path());

    let overrides = Overrides {
        host: Some("new.example.com".to_string()),
        path: Some("/srv/staging".to_string()),
        ..Default::default()
    };
    let (_, config) = resolve_config(&loader, Some("staging"), &StaticProvider, &overrides)
        .await
        .unwrap();
    assert_eq!(config.server.host, "new.example.com");
    assert_eq!(config.deploy.path, "/srv/staging");

    let bad = Overrides {
        path: Some("/".to_string()),
        ..Default::default()
    };
    let err = resolve_config(&loader, Some("staging"), &StaticProvider, &bad)
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::ConfigError(_)));
}

#[tokio::test]
async fn test_save_keeps_unknown_keys() {
    let dir = tempfile::tempdir().unwrap();
    write_descriptor(
        &dir,
        "production",
        r#"{"name":"shop","repository":"git@example.com:shop.git",
            "server":{"host":"h","user":"u","password":"s3cret"},
            "deploy":{"path":"/srv/app","cacheTtl":30}}"#,
    );
    let loader = ConfigLoader::new(dir.path());
    let (env, config) = loader.load(None).await.unwrap();

    loader.save(&env, &config).await.unwrap();

    let raw = std::fs::read_to_string(dir.path().join(".koram-rc.production.json")).unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value["repository"], "git@example.com:shop.git");
    assert_eq!(value["deploy"]["cacheTtl"], 30);
    assert!(value["server"].get("password").is_none());
}

#[tokio::test]
async fn test_init_names_project_from_manifest() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("package.json"), r#"{"name":"@acme/storefront"}"#).unwrap();
    let options = AppOptions {
        project_root: dir.path().to_path_buf(),
        ..Default::default()
    };

    let path = run_init(options, None, false).await.unwrap();

    assert!(path.ends_with(".koram-rc.production.json"));
    let (_, config) = ConfigLoader::new(dir.path()).load(None).await.unwrap();
    assert_eq!(config.name, "acme-storefront");
    assert_eq!(config.deploy.path, "/var/www/acme-storefront");
}
