#[cfg(test)]
mod tests {
    use std::env;
    use std::time::Duration;

    use serde_json::json;
    use serial_test::serial;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::flag::{EntityKind, EntityState, Flag, Operation, Rule, Variant, VariantType};
    use crate::format::{format_rule, format_variant};
    use crate::tracker::{FlagField, RuleField, VariantField, WorkingCopy};
    use crate::{Client, Editor, EditorState, Store, StoreError};

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    async fn create_test_client(server: &MockServer) -> Client {
        Client::builder()
            .with_base_url(&server.uri())
            .with_max_retries(0)
            .build()
            .expect("Failed to build test client")
    }

    fn flag_with(variants: Vec<Variant>, rules: Vec<Rule>) -> Flag {
        Flag {
            id: "f1".to_string(),
            key: "checkout".to_string(),
            name: "Checkout".to_string(),
            description: None,
            enabled: true,
            default_variant_when_on: None,
            default_variant_when_off: None,
            variants,
            rules,
            version: 1,
            created_at: None,
            updated_at: None,
            state: EntityState::Unmodified,
        }
    }

    fn persisted_variant(id: &str, value: serde_json::Value) -> Variant {
        Variant::from_remote(id.to_string(), value, None)
    }

    fn persisted_rule(id: &str, variant_id: &str) -> Rule {
        Rule {
            id: id.to_string(),
            variant_id: variant_id.to_string(),
            constraints: vec![],
            state: EntityState::Unmodified,
        }
    }

    fn flag_body() -> serde_json::Value {
        json!({
            "flag": {
                "id": "f1",
                "key": "checkout",
                "name": "Checkout",
                "description": "new checkout flow",
                "enabled": true,
                "defaultVariantWhenOn": "1",
                "version": 3,
                "createdAt": "2024-01-02T03:04:05Z",
                "variants": [
                    {"id": "1", "value": true},
                    {"id": "2", "value": 2.5, "description": "ratio"},
                    {"id": "3", "value": "blue"},
                    {"id": "4", "value": {"a": 1}}
                ],
                "rules": [
                    {
                        "id": "r1",
                        "variantId": "1",
                        "constraints": [
                            {"property": "country", "operation": "ONE_OF", "values": ["NZ", "AU"]}
                        ]
                    }
                ]
            },
            "operations": ["ONE_OF", "DOESNT_EXIST", "ISNT_IN_SEGMENT"],
            "segments": [{"id": "s1", "name": "beta"}]
        })
    }

    #[tokio::test]
    async fn test_client_initialization() {
        let client = Client::builder()
            .with_base_url("https://admin.example.com/api/")
            .with_max_retries(5)
            .with_timeout(Duration::from_secs(2))
            .build()
            .unwrap();

        assert_eq!(client.base_url, "https://admin.example.com/api");
        assert_eq!(client.max_retries, 5);
    }

    #[test]
    #[serial]
    fn test_builder_reads_environment() {
        env::set_var("FLAGS_ADMIN_URL", "https://env.example.com");
        env::set_var("FLAGS_ADMIN_MAX_RETRIES", "7");
        env::set_var("FLAGS_ADMIN_TIMEOUT_SECS", "not-a-number");

        let client = Client::builder().with_env().build().unwrap();
        assert_eq!(client.base_url, "https://env.example.com");
        assert_eq!(client.max_retries, 7);

        env::remove_var("FLAGS_ADMIN_URL");
        env::remove_var("FLAGS_ADMIN_MAX_RETRIES");
        env::remove_var("FLAGS_ADMIN_TIMEOUT_SECS");
    }

    #[test]
    #[serial]
    fn test_builder_without_environment_keeps_defaults() {
        env::remove_var("FLAGS_ADMIN_URL");
        env::remove_var("FLAGS_ADMIN_MAX_RETRIES");

        let client = Client::builder()
            .with_base_url("https://explicit.example.com")
            .with_env()
            .build()
            .unwrap();
        assert_eq!(client.base_url, "https://explicit.example.com");
        assert_eq!(client.max_retries, 3);
    }

    #[tokio::test]
    async fn test_fetch_flag_from_api() {
        init_logger();
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/flags/f1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(flag_body()))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server).await;
        let data = client.fetch_flag("f1").await.unwrap();

        assert_eq!(data.flag.key, "checkout");
        assert_eq!(data.flag.version, 3);
        assert_eq!(data.flag.default_variant_when_on.as_deref(), Some("1"));
        assert_eq!(data.flag.default_variant_when_off, None);
        assert!(data.flag.created_at.is_some());
        assert_eq!(data.operations, vec![Operation::OneOf, Operation::DoesntExist, Operation::IsntInSegment]);
        assert_eq!(data.segments[0].name, "beta");

        let types: Vec<VariantType> = data.flag.variants.iter().map(|v| v.variant_type).collect();
        assert_eq!(
            types,
            vec![VariantType::Boolean, VariantType::Number, VariantType::String, VariantType::Json]
        );
        assert_eq!(data.flag.variants[0].value, "true");
        assert_eq!(data.flag.variants[2].value, "blue");
        assert_eq!(data.flag.variants[1].description.as_deref(), Some("ratio"));
        assert!(data.flag.variants.iter().all(|v| v.state == EntityState::Unmodified));

        let rule = &data.flag.rules[0];
        assert_eq!(rule.variant_id, "1");
        assert_eq!(rule.constraints[0].operation, Operation::OneOf);
    }

    #[tokio::test]
    async fn test_fetch_flag_not_found() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/flags/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "flag: not found"})))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server).await;
        match client.fetch_flag("missing").await {
            Err(StoreError::NotFound(message)) => assert_eq!(message, "flag: not found"),
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_flag_retries_transport_errors() {
        let client = Client::builder()
            .with_base_url("http://127.0.0.1:1")
            .with_max_retries(1)
            .with_timeout(Duration::from_millis(200))
            .build()
            .unwrap();

        match client.fetch_flag("f1").await {
            Err(StoreError::HttpError(_)) => {}
            other => panic!("expected HttpError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dropped_save_returns_editor_to_ready() {
        init_logger();
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/flags/f1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(flag_body()))
            .mount(&mock_server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/flags/f1/variants/3"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"id": "3"}))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server).await;
        let mut editor = Editor::new(std::sync::Arc::new(client));
        editor.load("f1").await.unwrap();
        editor.update_variant("3", VariantField::Value("green".to_string())).unwrap();

        let interrupted = tokio::time::timeout(Duration::from_millis(100), editor.save()).await;
        assert!(interrupted.is_err());

        assert_eq!(editor.state(), &EditorState::Ready);
        let kept = editor.flag().unwrap().variant("3").unwrap();
        assert_eq!(kept.state, EntityState::Modified);
        assert_eq!(kept.value, "green");
        assert!(editor.update_flag(FlagField::Enabled(false)).is_ok());
    }

    #[tokio::test]
    async fn test_create_variant_posts_formatted_payload() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/flags/f1/variants"))
            .and(body_json(json!({"type": "number", "value": 42, "description": null})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "99"})))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server).await;
        let mut copy = WorkingCopy::new(flag_with(vec![], vec![]));
        let id = copy.add_variant();
        copy.update_variant(&id, VariantField::Type(VariantType::Number));
        copy.update_variant(&id, VariantField::Value("42".to_string()));

        let input = format_variant(copy.flag().variant(&id).unwrap());
        let created = client.create_variant("f1", &input).await.unwrap();
        assert_eq!(created, "99");
    }

    #[tokio::test]
    async fn test_update_rule_maps_status_codes() {
        let mock_server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(path("/flags/f1/rules/r1"))
            .respond_with(ResponseTemplate::new(422).set_body_json(json!({"message": "bad constraint"})))
            .mount(&mock_server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/flags/f1/variants/1"))
            .respond_with(ResponseTemplate::new(409).set_body_string("in use"))
            .mount(&mock_server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/flags/f1"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server).await;

        let input = format_rule(&persisted_rule("r1", "1"));
        match client.update_rule("f1", "r1", &input).await {
            Err(StoreError::Validation(message)) => assert_eq!(message, "bad constraint"),
            other => panic!("expected Validation, got {:?}", other),
        }
        assert!(matches!(
            client.delete_variant("f1", "1").await,
            Err(StoreError::ReferentialConstraint(_))
        ));
        assert!(matches!(client.delete_flag("f1").await, Err(StoreError::ApiError(_))));
    }

    #[tokio::test]
    async fn test_delete_rule_returns_deleted_id() {
        let mock_server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/flags/f1/rules/r9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "r9"})))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server).await;
        assert_eq!(client.delete_rule("f1", "r9").await.unwrap(), "r9");
    }

    #[test]
    fn test_update_marks_only_persisted_entities_modified() {
        let mut copy = WorkingCopy::new(flag_with(vec![persisted_variant("1", json!(true))], vec![]));
        assert!(!copy.is_dirty());

        assert!(copy.update_variant("1", VariantField::Description(Some("on".to_string()))));
        assert_eq!(copy.flag().variant("1").unwrap().state, EntityState::Modified);

        let id = copy.add_variant();
        assert!(copy.update_variant(&id, VariantField::Value("true".to_string())));
        assert_eq!(copy.flag().variant(&id).unwrap().state, EntityState::New);

        assert!(!copy.update_variant("nope", VariantField::Value("x".to_string())));
    }

    #[test]
    fn test_type_change_clears_value() {
        let mut copy = WorkingCopy::new(flag_with(vec![persisted_variant("1", json!(true))], vec![]));
        copy.update_variant("1", VariantField::Type(VariantType::Number));

        let variant = copy.flag().variant("1").unwrap();
        assert_eq!(variant.variant_type, VariantType::Number);
        assert_eq!(variant.value, "");
    }

    #[test]
    fn test_flag_field_edit_marks_flag() {
        let mut copy = WorkingCopy::new(flag_with(vec![], vec![]));
        copy.update_flag(FlagField::Enabled(false));
        assert_eq!(copy.flag().state, EntityState::Modified);
        assert!(!copy.flag().enabled);
        assert!(copy.is_dirty());
    }

    #[test]
    fn test_add_then_delete_leaves_no_trace() {
        let mut copy = WorkingCopy::new(flag_with(vec![persisted_variant("1", json!(true))], vec![]));
        let before = copy.flag().clone();

        let variant = copy.add_variant();
        let rule = copy.add_rule("1");
        copy.delete(EntityKind::Rule, &rule).unwrap();
        copy.delete(EntityKind::Variant, &variant).unwrap();

        assert_eq!(copy.flag(), &before);
        assert!(copy.deletions().is_empty());
        assert!(!copy.is_dirty());
    }

    #[test]
    fn test_delete_persisted_records_deletion() {
        let mut copy = WorkingCopy::new(flag_with(
            vec![persisted_variant("7", json!("a"))],
            vec![persisted_rule("r1", "7")],
        ));

        copy.delete(EntityKind::Rule, "r1").unwrap();
        copy.delete(EntityKind::Variant, "7").unwrap();

        let kinds: Vec<(EntityKind, &str, &str)> = copy
            .deletions()
            .iter()
            .map(|d| (d.kind, d.id.as_str(), d.flag_id.as_str()))
            .collect();
        assert_eq!(kinds, vec![(EntityKind::Rule, "r1", "f1"), (EntityKind::Variant, "7", "f1")]);
        assert!(copy.delete(EntityKind::Variant, "7").is_none());
        assert_eq!(
            serde_json::to_value(&copy.deletions()[1]).unwrap(),
            json!({"type": "variant", "id": "7", "flagId": "f1"})
        );
    }

    #[test]
    fn test_restore_cancels_deletion_record() {
        let mut copy = WorkingCopy::new(flag_with(
            vec![persisted_variant("1", json!(true)), persisted_variant("2", json!(false))],
            vec![],
        ));
        copy.update_variant("1", VariantField::Description(Some("edited".to_string())));

        let removed = copy.delete(EntityKind::Variant, "1").unwrap();
        assert_eq!(copy.deletions().len(), 1);

        assert!(copy.restore(removed.clone()));
        assert!(copy.deletions().is_empty());
        assert_eq!(copy.flag().variants[0].id, "1");
        assert_eq!(copy.flag().variants[0].state, EntityState::Modified);

        assert!(!copy.restore(removed));
    }

    #[test]
    fn test_re_adding_after_delete_is_delete_plus_create() {
        let mut copy = WorkingCopy::new(flag_with(vec![persisted_variant("1", json!(true))], vec![]));
        copy.delete(EntityKind::Variant, "1").unwrap();
        let id = copy.add_variant();
        copy.update_variant(&id, VariantField::Value("true".to_string()));

        assert_eq!(copy.deletions().len(), 1);
        assert_eq!(copy.flag().variant(&id).unwrap().state, EntityState::New);
    }

    #[test]
    fn test_entities_never_in_copy_and_deletions() {
        let mut copy = WorkingCopy::new(flag_with(
            vec![persisted_variant("1", json!(true)), persisted_variant("2", json!(1))],
            vec![persisted_rule("r1", "1")],
        ));

        let v = copy.add_variant();
        copy.update_variant("2", VariantField::Value("3".to_string()));
        copy.update_rule("r1", RuleField::Variant("2".to_string()));
        copy.delete(EntityKind::Variant, "1").unwrap();
        let removed = copy.delete(EntityKind::Variant, &v).unwrap();
        copy.restore(removed);
        copy.delete(EntityKind::Rule, "r1").unwrap();

        for deletion in copy.deletions() {
            let present = match deletion.kind {
                EntityKind::Variant => copy.flag().variant(&deletion.id).is_some(),
                EntityKind::Rule => copy.flag().rule(&deletion.id).is_some(),
            };
            assert!(!present, "{} {} is in both", deletion.kind, deletion.id);
        }
        for variant in &copy.flag().variants {
            assert!(!(variant.state == EntityState::New
                && copy.deletions().iter().any(|d| d.id == variant.id)));
        }
        assert_eq!(copy.flag().variant(&v).unwrap().state, EntityState::New);
    }

    #[test]
    fn test_placeholders_are_unique() {
        let mut copy = WorkingCopy::new(flag_with(
            vec![persisted_variant("new-variant-1", json!(true))],
            vec![],
        ));
        let a = copy.add_variant();
        let b = copy.add_variant();
        assert_ne!(a, "new-variant-1");
        assert_ne!(a, b);
    }

    #[test]
    fn test_mark_saved_resolves_placeholders() {
        let mut copy = WorkingCopy::new(flag_with(vec![persisted_variant("1", json!(true))], vec![]));
        let v = copy.add_variant();
        let r = copy.add_rule(&v);
        copy.delete(EntityKind::Variant, "1").unwrap();

        let resolved = [(v.clone(), "100".to_string()), (r.clone(), "200".to_string())]
            .into_iter()
            .collect();
        copy.mark_saved(&resolved);

        assert!(!copy.is_dirty());
        assert_eq!(copy.flag().variants[0].id, "100");
        assert_eq!(copy.flag().rules[0].id, "200");
        assert_eq!(copy.flag().rules[0].variant_id, "100");
    }
}
