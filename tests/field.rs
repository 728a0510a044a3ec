mod common;

use grow::{Catalog, Contract, Field, GrowError, PlantDef, ProcState, ServiceDescriptor, grow_with};
use serde_json::json;

use common::{Access, Manager, catalog, config};

#[tokio::test]
async fn injected_plants_answer_in_the_same_proc() {
    let field = Field::new()
        .plant("Manager", PlantDef::in_proc("main"))
        .plant("Access", PlantDef::in_proc("main"));
    let grown = grow_with(field, catalog(), config()).await.unwrap();

    let items = grown.plant("Manager").call("listItems", vec![]).await.unwrap();
    assert_eq!(items.as_array().map(Vec::len), Some(2));
    grown.kill().await;
}

#[tokio::test]
async fn injected_plants_answer_across_worker_procs() {
    let field = Field::new()
        .plant("Manager", PlantDef::default())
        .plant("Access", PlantDef::default());
    let grown = grow_with(field, catalog(), config()).await.unwrap();

    assert_eq!(grown.field().proc_of("Manager"), Some("Manager"));
    assert_eq!(grown.proc_state("Access"), Some(ProcState::Serving));
    let items = grown.plant("Manager").call("listItems", vec![]).await.unwrap();
    assert_eq!(items, json!([{ "id": 1 }, { "id": 2 }]));
    grown.kill().await;
}

#[tokio::test]
async fn session_follows_the_call_chain() {
    let field = Field::new()
        .plant("Manager", PlantDef::in_proc("front"))
        .plant("Access", PlantDef::in_proc("back"));
    let grown = grow_with(field, catalog(), config()).await.unwrap();

    let session = grown
        .plant_with_session("Manager", "ABC")
        .call("getSession", vec![])
        .await
        .unwrap();
    assert_eq!(session, json!("ABC"));
    grown.kill().await;
}

#[tokio::test]
async fn caller_proxy_reaches_back() {
    let field = Field::new()
        .plant("Publisher", PlantDef::in_proc("pub"))
        .plant("Subscriber", PlantDef::in_proc("sub"));
    let grown = grow_with(field, catalog(), config()).await.unwrap();

    let who = grown.plant("Subscriber").call("goAndSubscribe", vec![]).await.unwrap();
    assert_eq!(who, json!("subscriber"));
    grown.kill().await;
}

#[tokio::test]
async fn plant_errors_are_not_crashes() {
    let field = Field::new()
        .plant("Manager", PlantDef::in_proc("w"))
        .plant("Access", PlantDef::in_proc("w"));
    let grown = grow_with(field, catalog(), config()).await.unwrap();

    let err = grown.plant("Manager").call("throwErr", vec![]).await.unwrap_err();
    assert_eq!(err.name(), "error");
    assert!(err.to_string().contains("something went wrong"));
    assert_eq!(grown.proc_state("w"), Some(ProcState::Serving));

    let items = grown.plant("Manager").call("listItems", vec![]).await.unwrap();
    assert_eq!(items.as_array().map(Vec::len), Some(2));
    grown.kill().await;
}

#[tokio::test]
async fn unknown_plants_and_methods_are_reported() {
    let field = Field::new().plant("Access", PlantDef::in_proc("w"));
    let grown = grow_with(field, catalog(), config()).await.unwrap();

    let err = grown.plant("Ghost").call("boo", vec![]).await.unwrap_err();
    assert!(matches!(err, GrowError::ProcNotFound(_)));
    let err = grown.plant("Access").call("nothing", vec![]).await.unwrap_err();
    assert_eq!(err.name(), "notFound");
    grown.kill().await;
}

#[tokio::test]
async fn contracts_reject_undeclared_methods() {
    let field = Field::new().plant(
        "Access",
        PlantDef::in_proc("w").with_contract(Contract::new("Items", &["getItems"])),
    );
    let grown = grow_with(field, catalog(), config()).await.unwrap();

    let items = grown.plant("Access").call("getItems", vec![]).await.unwrap();
    assert_eq!(items.as_array().map(Vec::len), Some(2));
    let err = grown.plant("Access").call("secret", vec![]).await.unwrap_err();
    assert!(matches!(err, GrowError::MethodNotFound { .. }));
    grown.kill().await;
}

#[tokio::test]
async fn cyclic_injection_fails_before_spawning() {
    let catalog = Catalog::new()
        .register("A", ServiceDescriptor::new().inject("b"), || Ok(Box::new(Access)))
        .register("B", ServiceDescriptor::new().inject("a"), || Ok(Box::new(Access)));
    let field = Field::new()
        .plant("A", PlantDef::default())
        .plant("B", PlantDef::default());

    let err = grow_with(field, catalog, config()).await.err().unwrap();
    match err {
        GrowError::CyclicDependency(plants) => assert_eq!(plants, vec!["A", "B"]),
        other => panic!("expected a cycle, got {other}"),
    }
}

#[tokio::test]
async fn missing_plants_fail_the_whole_field() {
    let field = Field::new()
        .plant("Manager", PlantDef::in_proc("front"))
        .plant("Unregistered", PlantDef::in_proc("back"));
    let catalog = Catalog::new().register_plant::<Manager>("Manager");

    let err = grow_with(field, catalog, config()).await.err().unwrap();
    assert_eq!(err.name(), "importFailed");
}

#[tokio::test]
async fn invalid_plant_names_are_rejected() {
    let field = Field::new().plant("@field", PlantDef::default());
    let err = grow_with(field, catalog(), config()).await.err().unwrap();
    assert!(matches!(err, GrowError::Validation(_)));
}
