//! Full-pass behavior of the top-level reconciler against the mock
//! executor: stage ordering, user auth modes, idempotence of a whole pass,
//! and the fatal validation errors.

mod common;

use std::sync::Arc;

use common::{Catalog, MockExecutor};
use pg_dirsync::pg::SqlExecutor;
use pg_dirsync::{Config, Reconciler, SyncError};

fn config(yaml: &str) -> Config {
    serde_yaml::from_str(yaml).unwrap()
}

fn reconciler(yaml: &str, mock: &Arc<MockExecutor>) -> Reconciler {
    Reconciler::with_executor(config(yaml), mock.clone() as Arc<dyn SqlExecutor>)
}

const FULL_STATE: &str = r#"
roles:
  readers: { options: [NOLOGIN], memberof: [reporting] }
users:
  alice:
    auth: md5
    password: secret
    expiry: "2027-01-01T00:00:00Z"
  cert1:
    auth: clientcert
    memberof: [readers]
databases:
  app1:
    owner: app1_owner
slots:
  - standby1
"#;

#[tokio::test]
async fn test_full_pass_then_converged() {
    let mut catalog = Catalog::new();
    catalog
        .ungranted_schemas
        .insert("app1".to_string(), vec!["public".to_string()]);
    let mock = Arc::new(MockExecutor::new(catalog));

    let mut pass = reconciler(FULL_STATE, &mock);
    pass.run().await.unwrap();

    // Spot-check each stage reached the executor.
    assert!(!mock.statements_matching("CREATE ROLE \"readers\"").is_empty());
    assert!(!mock
        .statements_matching("GRANT \"reporting\" TO \"readers\"")
        .is_empty());
    assert!(!mock
        .statements_matching("ALTER ROLE \"readers\" WITH NOLOGIN")
        .is_empty());
    assert!(!mock
        .statements_matching("ALTER ROLE \"alice\" WITH ENCRYPTED PASSWORD")
        .is_empty());
    assert!(!mock
        .statements_matching("ALTER ROLE \"alice\" VALID UNTIL '2027-01-01 00:00:00+00'")
        .is_empty());
    assert!(!mock.statements_matching("GRANT \"readers\" TO \"cert1\"").is_empty());
    assert!(!mock.statements_matching("CREATE DATABASE \"app1\"").is_empty());
    assert!(!mock
        .statements_matching("pg_create_physical_replication_slot")
        .is_empty());

    // A whole second pass over the converged catalog issues zero statements.
    mock.clear_log();
    let mut pass = reconciler(FULL_STATE, &mock);
    pass.run().await.unwrap();
    assert_eq!(mock.statement_count(), 0, "{:?}", mock.statements());
}

#[tokio::test]
async fn test_roles_are_reconciled_before_databases() {
    let mock = Arc::new(MockExecutor::new(Catalog::new()));
    let state = r#"
roles:
  app1_owner: { options: [NOLOGIN] }
databases:
  app1: { owner: app1_owner }
"#;
    let mut pass = reconciler(state, &mock);
    pass.run().await.unwrap();

    let sqls: Vec<String> = mock.statements().into_iter().map(|s| s.sql).collect();
    let role_pos = sqls
        .iter()
        .position(|s| s == "CREATE ROLE \"app1_owner\"")
        .unwrap();
    let db_pos = sqls
        .iter()
        .position(|s| s == "CREATE DATABASE \"app1\"")
        .unwrap();
    assert!(role_pos < db_pos);

    // The owner role was already cached, so the database stage creates it
    // exactly once.
    assert_eq!(
        sqls.iter()
            .filter(|s| *s == "CREATE ROLE \"app1_owner\"")
            .count(),
        1
    );
}

#[tokio::test]
async fn test_clientcert_user_gets_login_and_password_reset() {
    let mut catalog = Catalog::new();
    catalog.roles.insert("cert1".to_string());
    catalog
        .role_flags
        .insert(("cert1".to_string(), "rolcanlogin".to_string()), true);
    catalog
        .shadow
        .insert("cert1".to_string(), Some("md5stale".to_string()));
    let mock = Arc::new(MockExecutor::new(catalog));

    let state = r#"
users:
  cert1: { auth: clientcert }
"#;
    let mut pass = reconciler(state, &mock);
    pass.run().await.unwrap();

    let statements = mock.statements();
    assert_eq!(statements.len(), 1);
    assert_eq!(statements[0].sql, "ALTER ROLE \"cert1\" WITH PASSWORD NULL");
}

#[tokio::test]
async fn test_ldap_group_requires_base_dn_and_filter() {
    let mock = Arc::new(MockExecutor::new(Catalog::new()));
    let state = r#"
users:
  devs: { auth: ldap-group }
"#;
    let mut pass = reconciler(state, &mock);
    let err = pass.run().await.unwrap_err();
    assert!(matches!(err, SyncError::MissingSearchBase(user) if user == "devs"));
    assert_eq!(mock.statement_count(), 0);
}

#[tokio::test]
async fn test_invalid_role_option_aborts_without_statements() {
    let mock = Arc::new(MockExecutor::new(Catalog::new()));
    let state = r#"
roles:
  app: { options: [FOOBAR] }
"#;
    let mut pass = reconciler(state, &mock);
    let err = pass.run().await.unwrap_err();
    assert!(err.to_string().contains("FOOBAR"));
    assert_eq!(mock.statement_count(), 0);
}

#[tokio::test]
async fn test_conflicting_state_across_stages_under_strict_users() {
    let mock = Arc::new(MockExecutor::new(Catalog::new()));
    let state = r#"
strict: { users: true }
roles:
  shared: {}
users:
  shared: { auth: clientcert, state: absent }
"#;
    let mut pass = reconciler(state, &mock);
    let err = pass.run().await.unwrap_err();
    assert!(matches!(err, SyncError::RoleStateConflict { .. }));
}
