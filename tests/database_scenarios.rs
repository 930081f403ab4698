use std::sync::Arc;

use stratum_core::config::StratumConfig;
use stratum_core::{Database, Metadata, Value};
use stratum_core::query::{ConnectedQuery, Query, Strategy};
use stratum_core::graph_index::Direction;
use stratum_core::metadata_index::Predicate;
use uuid::Uuid;

fn vec_at(dim: usize, lead: f32) -> Vec<f32> {
    let mut v = vec![0.0f32; dim];
    v[0] = lead;
    v
}

async fn open_database(dim: usize) -> Database {
    let store: Arc<dyn stratum_core::blob_store::BlobStore> = Arc::new(stratum_core::blob_store::MemoryStore::new());
    Database::open(store, StratumConfig::new(dim)).await.unwrap()
}

#[tokio::test]
async fn nearest_neighbor_search_ranks_closest_vector_first() {
    let database = open_database(8).await;
    let mut expected_nearest = Uuid::nil();
    for i in 0..50u32 {
        let id = database
            .add("Item", vec_at(8, i as f32), Metadata::new(), None)
            .await
            .unwrap();
        if i == 37 {
            expected_nearest = id;
        }
    }

    let query = Query {
        noun_type: Some("Item".to_string()),
        like: Some(vec_at(8, 37.0)),
        limit: 5,
        ..Query::default()
    };
    let outcome = database.search(&query, None).await.unwrap();
    assert_eq!(outcome.results.len(), 5);
    let top_id = database.resolve_noun_id(outcome.results[0].id).unwrap();
    assert_eq!(top_id, expected_nearest);
}

#[tokio::test]
async fn metadata_filter_narrows_before_vector_ranking() {
    let database = open_database(8).await;
    for i in 0..30u32 {
        let mut metadata = Metadata::new();
        let tier = if i % 10 == 0 { "gold" } else { "silver" };
        metadata.insert("tier".to_string(), Value::String(tier.to_string()));
        database.add("Item", vec_at(8, i as f32), metadata, None).await.unwrap();
    }

    let query = Query {
        noun_type: Some("Item".to_string()),
        like: Some(vec_at(8, 20.0)),
        where_predicates: vec![("tier".to_string(), Predicate::Equals(Value::String("gold".to_string())))],
        limit: 10,
        ..Query::default()
    };
    let outcome = database.search(&query, None).await.unwrap();
    assert_eq!(outcome.results.len(), 3);
    assert!(outcome.explain.is_none());
}

#[tokio::test]
async fn connected_query_reaches_neighbors_through_graph_edges() {
    let database = open_database(4).await;
    let hub = database.add("Person", vec_at(4, 1.0), Metadata::new(), None).await.unwrap();
    let mut friends = Vec::new();
    for i in 0..5u32 {
        let friend = database.add("Person", vec_at(4, 10.0 + i as f32), Metadata::new(), None).await.unwrap();
        database.relate(hub, friend, "knows", Metadata::new(), None, None, None).await.unwrap();
        friends.push(friend);
    }
    let stranger = database.add("Person", vec_at(4, 99.0), Metadata::new(), None).await.unwrap();

    // resolve_noun_id only maps int -> uuid; recover hub's int id via search.
    let seed = Query {
        noun_type: Some("Person".to_string()),
        like: Some(vec_at(4, 1.0)),
        limit: 1,
        ..Query::default()
    };
    let hub_result = database.search(&seed, None).await.unwrap();
    let hub_int_id = hub_result.results[0].id;

    let query = Query {
        noun_type: Some("Person".to_string()),
        connected: Some(ConnectedQuery {
            from: hub_int_id,
            depth: 1,
            direction: Direction::Outgoing,
            type_filter: None,
        }),
        limit: 10,
        ..Query::default()
    };
    let outcome = database.search(&query, None).await.unwrap();
    let reached: Vec<Uuid> = outcome
        .results
        .iter()
        .map(|r| database.resolve_noun_id(r.id).unwrap())
        .collect();
    for friend in &friends {
        assert!(reached.contains(friend));
    }
    assert!(!reached.contains(&stranger));
}

#[tokio::test]
async fn range_predicate_selects_values_within_bounds() {
    let database = open_database(4).await;
    for year in 2000..2020i64 {
        let mut metadata = Metadata::new();
        metadata.insert("year".to_string(), Value::Integer(year));
        database.add("Record", vec_at(4, year as f32), metadata, None).await.unwrap();
    }

    let query = Query {
        noun_type: Some("Record".to_string()),
        where_predicates: vec![(
            "year".to_string(),
            Predicate::Range {
                min: Value::Integer(2010),
                max: Value::Integer(2016),
            },
        )],
        limit: 50,
        ..Query::default()
    };
    let outcome = database.search(&query, None).await.unwrap();
    assert_eq!(outcome.results.len(), 6);
}

#[tokio::test]
async fn branch_from_main_lets_history_diverge_and_asof_reads_the_past() {
    let database = open_database(4).await;
    let id = database.add("Item", vec_at(4, 1.0), Metadata::new(), None).await.unwrap();
    database.create_branch("experiment", None).await.unwrap();

    database.checkout("experiment");
    let mut delta = Metadata::new();
    delta.insert("label".to_string(), Value::String("modified".to_string()));
    database.update(&id, delta, true).await.unwrap();
    let modified = database.get(&id).await.unwrap();
    assert_eq!(modified.metadata.get("label"), Some(&Value::String("modified".to_string())));

    database.checkout("main");
    let unmodified = database.get(&id).await.unwrap();
    assert!(!unmodified.metadata.contains_key("label"));
}

#[tokio::test]
async fn cascading_delete_removes_incident_edges_but_not_the_other_endpoint() {
    let database = open_database(4).await;
    let source = database.add("Item", vec_at(4, 1.0), Metadata::new(), None).await.unwrap();
    let target = database.add("Item", vec_at(4, 2.0), Metadata::new(), None).await.unwrap();
    let verb_id = database
        .relate(source, target, "links_to", Metadata::new(), None, None, None)
        .await
        .unwrap();

    assert!(database.delete(&source, true).await.unwrap());
    assert!(!database.has(&source).await.unwrap());
    assert!(database.has(&target).await.unwrap());
    assert!(!database.delete_verb(&verb_id).await.unwrap());

    let stats = database.statistics();
    assert_eq!(stats.verb_count, 0);
    assert_eq!(stats.noun_count, 1);
}

#[tokio::test]
async fn cascading_delete_with_multiple_incident_verbs_only_removes_the_deleted_entitys_edges() {
    let database = open_database(4).await;
    let a = database.add("Item", vec_at(4, 1.0), Metadata::new(), None).await.unwrap();
    let b = database.add("Item", vec_at(4, 2.0), Metadata::new(), None).await.unwrap();
    let c = database.add("Item", vec_at(4, 3.0), Metadata::new(), None).await.unwrap();

    let v_ab = database.relate(a, b, "knows", Metadata::new(), None, None, None).await.unwrap();
    let v_ac = database.relate(a, c, "knows", Metadata::new(), None, None, None).await.unwrap();
    let v_bc = database.relate(b, c, "knows", Metadata::new(), None, None, None).await.unwrap();

    assert!(database.delete(&a, true).await.unwrap());

    assert!(!database.has(&a).await.unwrap());
    assert!(database.has(&b).await.unwrap());
    assert!(database.has(&c).await.unwrap());

    assert!(!database.delete_verb(&v_ab).await.unwrap());
    assert!(!database.delete_verb(&v_ac).await.unwrap());
    assert!(database.delete_verb(&v_bc).await.unwrap(), "b->c must survive a's cascading delete");

    let stats = database.statistics();
    assert_eq!(stats.noun_count, 2);
}

#[tokio::test]
async fn typed_metadata_values_round_trip_through_add_and_get() {
    let database = open_database(4).await;
    let mut metadata = Metadata::new();
    metadata.insert("rating".to_string(), Value::Float(4.5));
    metadata.insert("tags".to_string(), Value::StringArray(vec!["new".to_string(), "featured".to_string()]));
    let id = database.add("Item", vec_at(4, 1.0), metadata, None).await.unwrap();

    let noun = database.get(&id).await.unwrap();
    assert_eq!(noun.metadata.get("rating"), Some(&Value::Float(4.5)));
    assert_eq!(
        noun.metadata.get("tags"),
        Some(&Value::StringArray(vec!["new".to_string(), "featured".to_string()]))
    );
}

#[tokio::test]
async fn progressive_narrowing_is_chosen_for_highly_selective_filters() {
    let database = open_database(4).await;
    for i in 0..200u32 {
        let mut metadata = Metadata::new();
        metadata.insert("seq".to_string(), Value::String(i.to_string()));
        database.add("Item", vec_at(4, i as f32), metadata, None).await.unwrap();
    }
    let query = Query {
        noun_type: Some("Item".to_string()),
        like: Some(vec_at(4, 5.0)),
        where_predicates: vec![("seq".to_string(), Predicate::Equals(Value::String("5".to_string())))],
        limit: 10,
        explain: true,
        ..Query::default()
    };
    let outcome = database.search(&query, None).await.unwrap();
    assert_eq!(outcome.results.len(), 1);
    let explain = outcome.explain.unwrap();
    assert_eq!(explain.strategy, Strategy::ProgressiveNarrowing);
}
