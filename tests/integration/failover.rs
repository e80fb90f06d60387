//! Failover coordination against a live server plus a dead address.

use std::sync::Arc;
use std::time::Duration;

use hermes::{Blacklist, ConnectionUrl, Error, FailoverCoordinator, HostRole};

use crate::{get_server_config, skip_if_not_enabled};

#[tokio::test]
async fn connects_past_dead_primary_ordering() {
    skip_if_not_enabled!();
    let config = get_server_config();

    // A dead host listed first, the live server second; both primaries so
    // writes consider them in order
    let url = format!(
        "mysql://address=(host=127.0.0.1)(port=1)(type=master),address=(host={})(port={})(type=master)/{}?user={}&password={}&connectTimeout=1000",
        config.host, config.port, config.database, config.user, config.password
    );
    let coordinator = FailoverCoordinator::new(ConnectionUrl::parse(&url).unwrap());

    let session = coordinator.connect().await.expect("second host must win");
    assert_eq!(session.host().host, config.host);
    session.ping().await.unwrap();

    // The dead host is blacklisted now
    let dead = coordinator
        .hosts()
        .iter()
        .find(|h| h.port == 1)
        .unwrap()
        .clone();
    assert!(coordinator.blacklist().contains(&dead));
}

#[tokio::test]
async fn all_hosts_dead_is_non_transient() {
    skip_if_not_enabled!();
    let url = "mysql://127.0.0.1:1,127.0.0.1:2/db?user=u&connectTimeout=500";
    let coordinator = FailoverCoordinator::new(ConnectionUrl::parse(url).unwrap());

    let err = coordinator.connect().await.expect_err("must fail fast");
    assert!(matches!(err, Error::NoHostAvailable(_)));
}

#[tokio::test]
async fn failover_invalidates_old_session() {
    skip_if_not_enabled!();
    let config = get_server_config();
    let url = config.url("");
    let coordinator = FailoverCoordinator::new(ConnectionUrl::parse(&url).unwrap());

    let first = coordinator.connect().await.unwrap();
    first.ping().await.unwrap();

    let second = coordinator.failover().await.expect("same host reconnects");
    assert!(first.is_closed());
    assert!(!second.is_closed());
    second.ping().await.unwrap();

    // Handles from the replaced session fail locally
    let err = first.execute("SELECT 1").await.expect_err("old session");
    assert!(matches!(err, Error::ResourceClosed("Connection")));
}

#[tokio::test]
async fn read_only_switch_prefers_replicas() {
    skip_if_not_enabled!();
    let config = get_server_config();

    // Same physical server tagged once as master and once as slave; the
    // switch must land on the replica-tagged address
    let url = format!(
        "mysql://address=(host={h})(port={p})(type=master),address=(host={h})(port={p})(type=slave)/{db}?user={u}&password={pw}",
        h = config.host,
        p = config.port,
        db = config.database,
        u = config.user,
        pw = config.password
    );
    let coordinator = FailoverCoordinator::new(ConnectionUrl::parse(&url).unwrap());
    coordinator.connect().await.unwrap();

    let replica_session = coordinator.set_read_only(true).await.unwrap();
    assert!(coordinator.is_read_only());
    replica_session.ping().await.unwrap();

    let primary_session = coordinator.set_read_only(false).await.unwrap();
    assert!(!coordinator.is_read_only());
    primary_session.ping().await.unwrap();
}

#[tokio::test]
async fn shared_blacklist_is_visible_across_coordinators() {
    skip_if_not_enabled!();
    let config = get_server_config();
    let url = ConnectionUrl::parse(&config.url("")).unwrap();
    let blacklist = Arc::new(Blacklist::new(Duration::from_secs(60)));

    let a = FailoverCoordinator::with_blacklist(url.clone(), blacklist.clone());
    let b = FailoverCoordinator::with_blacklist(url, blacklist.clone());

    let dead = hermes::HostAddress::new("10.255.255.1", 3306, HostRole::Primary);
    a.blacklist().add(&dead);
    assert!(b.blacklist().contains(&dead));
}
