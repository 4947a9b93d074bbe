use super::*;
use crate::context::test_support::standalone_state;
use crate::types::acl::AclRule;

fn rule(pairs: &[(&str, &str)]) -> AclRule {
    let mut rule = AclRule {
        action: "allow".to_string(),
        state: "enabled".to_string(),
        ..Default::default()
    };

    for (key, value) in pairs {
        match *key {
            "action" => rule.action = value.to_string(),
            "state" => rule.state = value.to_string(),
            "source" => rule.source = value.to_string(),
            "destination" => rule.destination = value.to_string(),
            "protocol" => rule.protocol = value.to_string(),
            "source_port" => rule.source_port = value.to_string(),
            "destination_port" => rule.destination_port = value.to_string(),
            "icmp_type" => rule.icmp_type = value.to_string(),
            "icmp_code" => rule.icmp_code = value.to_string(),
            other => panic!("unknown rule field {}", other),
        }
    }

    rule
}

async fn validate(
    state: &crate::context::State,
    acl: &Acl,
    ingress: Vec<AclRule>,
    egress: Vec<AclRule>,
) -> crate::error::Result<()> {
    let mut put = AclPut { ingress, egress, ..Default::default() };
    acl.validate_config(state, &mut put).await
}

async fn new_acl(state: &crate::context::State, name: &str) -> Acl {
    create(state, "default", name, &AclPut::default()).await.unwrap()
}

#[tokio::test]
async fn test_valid_rule_sets() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;
    let acl = new_acl(&state, "web").await;

    let ok_sets = vec![
        vec![rule(&[("protocol", "tcp"), ("destination_port", "80,443")])],
        vec![rule(&[("protocol", "icmp4"), ("icmp_type", "8"), ("source", "10.0.0.0/24")])],
        vec![rule(&[("source", "10.0.0.1-10.0.0.9")])],
        vec![rule(&[("action", "allow-stateless")])],
        vec![rule(&[("action", "drop"), ("state", "logged")])],
        vec![rule(&[("source", "@internal")])],
        vec![rule(&[("source", "#external")])],
    ];

    for ingress in ok_sets {
        validate(&state, &acl, ingress, vec![]).await.unwrap();
    }
}

#[tokio::test]
async fn test_action_and_state_validated() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;
    let acl = new_acl(&state, "web").await;

    let err = validate(&state, &acl, vec![rule(&[("action", "permit")])], vec![])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Action must be one of"));

    let err = validate(&state, &acl, vec![rule(&[("state", "on")])], vec![])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("State must be one of"));
}

#[tokio::test]
async fn test_icmp_type_with_tcp_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;
    let acl = new_acl(&state, "web").await;

    let err = validate(
        &state,
        &acl,
        vec![rule(&[("protocol", "tcp"), ("icmp_type", "8")])],
        vec![],
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("ICMP type cannot be used with non-ICMP protocol"));
}

#[tokio::test]
async fn test_icmp4_rejects_ipv6_sources() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;
    let acl = new_acl(&state, "web").await;

    let err = validate(
        &state,
        &acl,
        vec![rule(&[("protocol", "icmp4"), ("source", "fe80::1")])],
        vec![],
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("Cannot use IPv6 source addresses"));

    let err = validate(
        &state,
        &acl,
        vec![rule(&[("protocol", "icmp6"), ("source", "10.0.0.1")])],
        vec![],
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("Cannot use IPv4 source addresses"));
}

#[tokio::test]
async fn test_ports_require_tcp_or_udp() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;
    let acl = new_acl(&state, "web").await;

    let err = validate(
        &state,
        &acl,
        vec![rule(&[("protocol", "icmp4"), ("source_port", "80")])],
        vec![],
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("Source port cannot be used with"));

    let err = validate(&state, &acl, vec![rule(&[("destination_port", "80")])], vec![])
        .await
        .unwrap_err();
    assert!(err
        .to_string()
        .contains("Destination port cannot be used without specifying protocol"));

    let err = validate(
        &state,
        &acl,
        vec![rule(&[("protocol", "tcp"), ("destination_port", "99999")])],
        vec![],
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("Invalid Destination port"));
}

#[tokio::test]
async fn test_duplicate_rules_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;
    let acl = new_acl(&state, "web").await;

    // Duplicates are detected after normalisation.
    let a = rule(&[("protocol", "tcp"), ("destination_port", "80, 443")]);
    let b = rule(&[("protocol", "tcp"), ("destination_port", "80,443")]);

    let err = validate(&state, &acl, vec![a, b], vec![]).await.unwrap_err();
    assert!(err.to_string().contains("Duplicate of ingress rule"));
}

#[tokio::test]
async fn test_named_subjects_only_in_origin_position() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;
    let acl = new_acl(&state, "web").await;
    let _other = new_acl(&state, "db").await;

    // Ingress: names allowed in Source, not Destination.
    validate(&state, &acl, vec![rule(&[("source", "db")])], vec![]).await.unwrap();

    let err = validate(&state, &acl, vec![rule(&[("destination", "db")])], vec![])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Named subjects not allowed"));

    // Egress: names allowed in Destination, not Source.
    validate(&state, &acl, vec![], vec![rule(&[("destination", "db")])]).await.unwrap();

    let err = validate(&state, &acl, vec![], vec![rule(&[("source", "db")])])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Named subjects not allowed"));
}

#[tokio::test]
async fn test_family_conflict() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;
    let acl = new_acl(&state, "web").await;

    let err = validate(
        &state,
        &acl,
        vec![rule(&[("source", "10.0.0.1"), ("destination", "fd00::1")])],
        vec![],
    )
    .await
    .unwrap_err();
    assert!(err
        .to_string()
        .contains("Conflicting IP family types used for Source and Destination"));

    // A named subject on the mismatched end mediates between families.
    let _other = new_acl(&state, "db").await;
    validate(
        &state,
        &acl,
        vec![],
        vec![rule(&[("source", "10.0.0.1"), ("destination", "db")])],
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn test_address_set_subject_must_exist() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;
    let acl = new_acl(&state, "web").await;

    let err = validate(&state, &acl, vec![rule(&[("source", "$missing")])], vec![])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("address set"));

    state
        .db
        .insert_address_set("default", "admins", &["10.0.0.1".to_string()])
        .await
        .unwrap();
    validate(&state, &acl, vec![rule(&[("source", "$admins")])], vec![]).await.unwrap();
}

#[tokio::test]
async fn test_normalisation_roundtrip() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;
    let acl = new_acl(&state, "web").await;

    let mut put = AclPut {
        ingress: vec![rule(&[("source", " 10.0.0.1 , 10.0.0.0/24 ,")])],
        ..Default::default()
    };

    acl.validate_config(&state, &mut put).await.unwrap();
    assert_eq!(put.ingress[0].source, "10.0.0.1,10.0.0.0/24");

    // Idempotent: validating the normalised form changes nothing.
    let normalised = put.ingress.clone();
    acl.validate_config(&state, &mut put).await.unwrap();
    assert_eq!(put.ingress, normalised);
}

#[tokio::test]
async fn test_update_applies_firewall_rules() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = crate::context::test_support::standalone_harness(tmp.path()).await;
    let state = harness.state.clone();

    let mut net_config = std::collections::HashMap::new();
    net_config.insert("security.acls".to_string(), "web".to_string());
    state.db.insert_network("default", "br0", "bridge", &net_config).await.unwrap();

    let mut acl = new_acl(&state, "web").await;

    let put = AclPut {
        ingress: vec![rule(&[("protocol", "tcp"), ("destination_port", "80")])],
        ..Default::default()
    };
    acl.update(&state, &put, ClientType::Normal).await.unwrap();

    let applied = harness.firewall.applied.lock().unwrap().clone();
    assert!(applied.contains(&"address-sets:inet:web".to_string()));
    assert!(applied.contains(&"rules:br0".to_string()));

    let stored = state.db.get_acl("default", "web").await.unwrap();
    assert_eq!(stored.ingress.len(), 1);
    assert_eq!(stored.ingress[0].destination_port, "80");
}

#[tokio::test]
async fn test_update_applies_bridge_nic_filters() {
    let tmp = tempfile::tempdir().unwrap();
    let harness = crate::context::test_support::standalone_harness(tmp.path()).await;
    let state = harness.state.clone();

    state
        .db
        .insert_network("default", "br0", "bridge", &std::collections::HashMap::new())
        .await
        .unwrap();

    let mut nic = std::collections::BTreeMap::new();
    nic.insert("type".to_string(), "nic".to_string());
    nic.insert("network".to_string(), "br0".to_string());
    nic.insert("security.acls".to_string(), "web".to_string());

    let mut devices = crate::types::Devices::new();
    devices.insert("eth0", nic);

    let args = crate::types::InstanceArgs {
        project: "default".to_string(),
        name: "c1".to_string(),
        node: "node1".to_string(),
        devices,
        ..Default::default()
    };
    state.db.insert_instance(&args).await.unwrap();

    let mut acl = new_acl(&state, "web").await;
    acl.update(&state, &AclPut::default(), ClientType::Normal).await.unwrap();

    let applied = harness.firewall.applied.lock().unwrap().clone();
    assert!(applied.contains(&"address-sets:bridge:web".to_string()));
    assert!(applied.contains(&"bridge:br0:eth0".to_string()));
}

#[tokio::test]
async fn test_rename_and_delete_gated_on_usage() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;

    let mut net_config = std::collections::HashMap::new();
    net_config.insert("security.acls".to_string(), "web".to_string());
    state.db.insert_network("default", "br0", "bridge", &net_config).await.unwrap();

    let mut acl = new_acl(&state, "web").await;

    let used_by = acl.used_by(&state, false).await.unwrap();
    assert_eq!(used_by, vec!["/1.0/networks/br0"]);

    let err = acl.rename(&state, "frontend").await.unwrap_err();
    assert!(err.to_string().contains("Cannot rename an ACL that is in use"));

    let err = acl.delete(&state).await.unwrap_err();
    assert!(err.to_string().contains("Cannot delete an ACL that is in use"));

    // An unused ACL renames and deletes fine.
    let mut unused = new_acl(&state, "spare").await;
    unused.rename(&state, "spare2").await.unwrap();
    unused.delete(&state).await.unwrap();
}

#[tokio::test]
async fn test_usage_via_instance_nic() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;

    state
        .db
        .insert_network("default", "br0", "bridge", &std::collections::HashMap::new())
        .await
        .unwrap();

    let mut nic = std::collections::BTreeMap::new();
    nic.insert("type".to_string(), "nic".to_string());
    nic.insert("network".to_string(), "br0".to_string());
    nic.insert("security.acls".to_string(), "web".to_string());

    let mut devices = crate::types::Devices::new();
    devices.insert("eth0", nic);

    let args = crate::types::InstanceArgs {
        project: "default".to_string(),
        name: "c1".to_string(),
        node: "node1".to_string(),
        devices,
        ..Default::default()
    };
    state.db.insert_instance(&args).await.unwrap();

    let acl = new_acl(&state, "web").await;
    let used_by = acl.used_by(&state, false).await.unwrap();
    assert_eq!(used_by, vec!["/1.0/instances/c1"]);

    // first_only stops at the first hit.
    let first = acl.used_by(&state, true).await.unwrap();
    assert_eq!(first.len(), 1);
}

#[tokio::test]
async fn test_get_log_filters_and_sorts() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;
    let acl = new_acl(&state, "web").await;

    let log = format!(
        "2024-01-03T10:00:00Z|0002|acl_log|cask_acl{id}-ingress|second\n\
         2024-01-01T09:00:00Z|0001|acl_log|cask_acl{id}-ingress|first\n\
         2024-01-02T09:30:00Z|0003|acl_log|cask_acl999-ingress|other acl\n",
        id = acl.id()
    );
    tokio::fs::write(&state.ovn_log_path, log).await.unwrap();

    let output = acl.get_log(&state, ClientType::Normal).await.unwrap();
    let lines: Vec<&str> = output.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("2024-01-01"));
    assert!(lines[1].starts_with("2024-01-03"));
    assert!(!output.contains("cask_acl999"));
}

#[tokio::test]
async fn test_get_log_without_file() {
    let tmp = tempfile::tempdir().unwrap();
    let state = standalone_state(tmp.path()).await;
    let acl = new_acl(&state, "web").await;

    let err = acl.get_log(&state, ClientType::Normal).await.unwrap_err();
    assert!(err.to_string().contains("Only OVN log entries may be retrieved"));
}
