//! End-to-end search pipeline tests against a real on-disk database.

mod util;

use std::collections::BTreeMap;

use util::{Fixture, digest};
use vtriage::model::types::{Label, TriageLabel};
use vtriage::search::RequestError;
use vtriage::search::cluster::ClusterRequest;
use vtriage::search::engine::{SearchRequest, SortDirection};
use vtriage::search::query::TraceFilter;

fn gm_filter() -> TraceFilter {
    TraceFilter {
        corpus: "gm".into(),
        key_values: BTreeMap::new(),
        include_ignored: false,
        at_head_only: true,
    }
}

fn untriaged_request() -> SearchRequest {
    SearchRequest {
        filter: gm_filter(),
        ..SearchRequest::default()
    }
}

/// One grouping, one trace: triaged digest A for four commits, untriaged C
/// at head, references A (positive) and B (negative).
fn single_regression_fixture() -> Fixture {
    let fx = Fixture::new();
    fx.add_commits(&[1, 2, 3, 4, 5]);
    let (_, grouping) = fx.add_trace(
        "circle",
        "gm",
        &[("os", "linux")],
        &[
            (1, Some(digest(10))),
            (2, Some(digest(10))),
            (3, Some(digest(10))),
            (4, Some(digest(10))),
            (5, Some(digest(30))),
        ],
    );
    fx.triage(grouping, digest(10), "p");
    fx.triage(grouping, digest(20), "n");
    fx.add_diff(digest(30), digest(10), 3, 0.2);
    fx.add_diff(digest(30), digest(20), 7, 0.5);
    fx
}

#[test]
fn untriaged_result_carries_both_references() {
    let fx = single_regression_fixture();
    let engine = fx.engine(5, &[]);

    let resp = engine.search(&untriaged_request()).unwrap();
    assert_eq!(resp.total, 1);
    assert_eq!(resp.commits.len(), 5);

    let result = &resp.results[0];
    assert_eq!(result.digest, digest(30));
    assert_eq!(result.status, Label::Untriaged);
    assert_eq!(result.test_name, "circle");
    assert_eq!(result.closest_label, Some(Label::Positive));

    let pos = result.pos_ref.as_ref().unwrap();
    assert_eq!(pos.digest, digest(10));
    assert_eq!(pos.combined_metric, 0.2);
    assert_eq!(pos.max_channel_diff, 3);

    let neg = result.neg_ref.as_ref().unwrap();
    assert_eq!(neg.digest, digest(20));
    assert_eq!(neg.combined_metric, 0.5);

    assert_eq!(result.paramset["os"], vec!["linux".to_string()]);
    assert_eq!(result.paramset["name"], vec!["circle".to_string()]);
}

#[test]
fn trace_group_ranks_result_digest_first() {
    let fx = single_regression_fixture();
    let engine = fx.engine(5, &[]);

    let resp = engine.search(&untriaged_request()).unwrap();
    let group = &resp.results[0].trace_group;
    assert_eq!(group.digests[0], digest(30));
    assert_eq!(group.digests[1], digest(10));
    assert_eq!(group.total_digests, 2);

    assert_eq!(group.traces.len(), 1);
    assert_eq!(group.traces[0].dots, vec![1, 1, 1, 1, 0]);
    assert_eq!(group.traces[0].params["os"], "linux");
}

/// One grouping, three traces: untriaged heads C1/C2/C3 at metrics
/// 0.1/0.2/0.3 from the shared positive reference.
fn three_result_fixture() -> Fixture {
    let fx = Fixture::new();
    fx.add_commits(&[1, 2, 3]);
    for (gpu, seed, metric) in [("amd", 1u8, 0.1), ("intel", 2, 0.2), ("nvidia", 3, 0.3)] {
        let (_, grouping) = fx.add_trace(
            "square",
            "gm",
            &[("gpu", gpu)],
            &[(1, Some(digest(100))), (3, Some(digest(seed)))],
        );
        fx.triage(grouping, digest(100), "p");
        fx.add_diff(digest(seed), digest(100), 4, metric);
    }
    fx
}

#[test]
fn pagination_respects_offset_and_limit() {
    let fx = three_result_fixture();
    let engine = fx.engine(3, &[]);

    let resp = engine
        .search(&SearchRequest {
            limit: 2,
            ..untriaged_request()
        })
        .unwrap();
    assert_eq!(resp.total, 3);
    assert_eq!(resp.results.len(), 2);
    assert_eq!(resp.results[0].digest, digest(1));
    assert_eq!(resp.results[1].digest, digest(2));

    let resp = engine
        .search(&SearchRequest {
            offset: 1,
            limit: 10,
            ..untriaged_request()
        })
        .unwrap();
    assert_eq!(resp.total, 3);
    assert_eq!(resp.results.len(), 2);
    assert_eq!(resp.results[0].digest, digest(2));

    // Offset past the end is an empty page, not an error.
    let resp = engine
        .search(&SearchRequest {
            offset: 10,
            ..untriaged_request()
        })
        .unwrap();
    assert_eq!(resp.total, 3);
    assert!(resp.results.is_empty());
}

#[test]
fn sort_direction_reverses_results() {
    let fx = three_result_fixture();
    let engine = fx.engine(3, &[]);

    let resp = engine
        .search(&SearchRequest {
            sort: SortDirection::Descending,
            ..untriaged_request()
        })
        .unwrap();
    let digests: Vec<_> = resp.results.iter().map(|r| r.digest).collect();
    assert_eq!(digests, vec![digest(3), digest(2), digest(1)]);
}

#[test]
fn filter_keys_narrow_the_match_set() {
    let fx = three_result_fixture();
    let engine = fx.engine(3, &[]);

    let mut filter = gm_filter();
    filter
        .key_values
        .insert("gpu".into(), vec!["amd".into(), "intel".into()]);
    let resp = engine
        .search(&SearchRequest {
            filter,
            ..SearchRequest::default()
        })
        .unwrap();
    assert_eq!(resp.total, 2);
    assert!(resp.results.iter().all(|r| r.digest != digest(3)));
}

#[test]
fn status_inclusion_is_honored() {
    let fx = Fixture::new();
    fx.add_commits(&[1]);
    let (_, grouping) = fx.add_trace("tri", "gm", &[], &[(1, Some(digest(5)))]);
    fx.triage(grouping, digest(5), "p");
    let engine = fx.engine(1, &[]);

    let resp = engine.search(&untriaged_request()).unwrap();
    assert_eq!(resp.total, 0);

    let resp = engine
        .search(&SearchRequest {
            include_positive: true,
            include_untriaged: false,
            ..untriaged_request()
        })
        .unwrap();
    assert_eq!(resp.total, 1);
    assert_eq!(resp.results[0].status, Label::Positive);
}

#[test]
fn reference_filters_drop_entries() {
    let fx = Fixture::new();
    fx.add_commits(&[1]);
    // g1 head has a reference at channel diff 3; g2 head has none.
    let (_, g1) = fx.add_trace("a", "gm", &[], &[(1, Some(digest(1)))]);
    fx.triage(g1, digest(50), "p");
    fx.add_diff(digest(1), digest(50), 3, 0.2);
    fx.add_trace("b", "gm", &[], &[(1, Some(digest(2)))]);
    let engine = fx.engine(1, &[]);

    // No-reference entries sort before referenced ones.
    let resp = engine.search(&untriaged_request()).unwrap();
    assert_eq!(resp.total, 2);
    assert_eq!(resp.results[0].digest, digest(2));
    assert!(resp.results[0].closest_label.is_none());

    let resp = engine
        .search(&SearchRequest {
            must_have_reference: true,
            ..untriaged_request()
        })
        .unwrap();
    assert_eq!(resp.total, 1);
    assert_eq!(resp.results[0].digest, digest(1));

    // Channel-diff bounds also imply a reference.
    let resp = engine
        .search(&SearchRequest {
            min_channel_diff: Some(5),
            ..untriaged_request()
        })
        .unwrap();
    assert_eq!(resp.total, 0);
    let resp = engine
        .search(&SearchRequest {
            max_channel_diff: Some(5),
            ..untriaged_request()
        })
        .unwrap();
    assert_eq!(resp.total, 1);
}

#[test]
fn ignored_traces_are_excluded_by_default() {
    let fx = Fixture::new();
    fx.add_commits(&[1]);
    let (trace, _) = fx.add_trace("ign", "gm", &[], &[(1, Some(digest(9)))]);
    fx.mark_ignored(trace);
    let engine = fx.engine(1, &[]);

    assert_eq!(engine.search(&untriaged_request()).unwrap().total, 0);

    let mut filter = gm_filter();
    filter.include_ignored = true;
    let resp = engine
        .search(&SearchRequest {
            filter,
            ..SearchRequest::default()
        })
        .unwrap();
    assert_eq!(resp.total, 1);
}

#[test]
fn null_ignore_state_counts_as_unignored() {
    // NULL means no ignore rules existed when the row was written.
    let fx = Fixture::new();
    fx.add_commits(&[1]);
    let (trace, _) = fx.add_trace("nul", "gm", &[], &[(1, Some(digest(9)))]);
    let conn = fx.writer();
    conn.execute(
        "UPDATE Traces SET matches_any_ignore_rule = NULL WHERE trace_id = ?",
        [trace],
    )
    .unwrap();
    conn.execute(
        "UPDATE ValuesAtHead SET matches_any_ignore_rule = NULL WHERE trace_id = ?",
        [trace],
    )
    .unwrap();
    let engine = fx.engine(1, &[]);
    assert_eq!(engine.search(&untriaged_request()).unwrap().total, 1);
}

#[test]
fn materialized_view_agrees_with_direct_query() {
    let fx = three_result_fixture();
    let direct = fx.engine(3, &[]);
    let viewed = fx.engine(3, &["gm"]);

    let a = direct.search(&untriaged_request()).unwrap();
    let b = viewed.search(&untriaged_request()).unwrap();
    assert_eq!(a.total, b.total);
    let left: Vec<_> = a.results.iter().map(|r| r.digest).collect();
    let right: Vec<_> = b.results.iter().map(|r| r.digest).collect();
    assert_eq!(left, right);
}

#[test]
fn bulk_triage_covers_all_matches_regardless_of_page() {
    let fx = three_result_fixture();
    // A fourth untriaged digest with no reference at all.
    fx.add_trace("square", "gm", &[("gpu", "mali")], &[(3, Some(digest(4)))]);
    let engine = fx.engine(3, &[]);

    let resp = engine
        .search(&SearchRequest {
            limit: 1,
            ..untriaged_request()
        })
        .unwrap();
    assert_eq!(resp.results.len(), 1);

    let suggestions = &resp.bulk_triage.0["square"];
    assert_eq!(suggestions.len(), 4);
    assert_eq!(suggestions[&digest(1)], TriageLabel::Positive);
    assert_eq!(suggestions[&digest(4)], TriageLabel::Empty);
}

#[test]
fn public_view_hides_restricted_traces_everywhere() {
    let fx = Fixture::new();
    fx.add_commits(&[1, 2]);
    let (_, grouping) = fx.add_trace(
        "circle",
        "gm",
        &[("os", "linux")],
        &[(1, Some(digest(1))), (2, Some(digest(2)))],
    );
    fx.add_trace(
        "circle",
        "gm",
        &[("os", "secret")],
        &[(1, Some(digest(1))), (2, Some(digest(3)))],
    );
    fx.triage(grouping, digest(1), "p");
    let engine = fx.engine_with_matcher(2, |params: &vtriage::model::types::Params| {
        params.get("os").is_some_and(|os| os == "linux")
    });

    // Search only surfaces digests produced by publicly-visible traces.
    let resp = engine.search(&untriaged_request()).unwrap();
    let digests: Vec<_> = resp.results.iter().map(|r| r.digest).collect();
    assert_eq!(digests, vec![digest(2)]);
    assert_eq!(resp.results[0].paramset["os"], vec!["linux".to_string()]);

    // Blame never counts the hidden trace's untriaged digest.
    let blames = engine.get_blames_for_untriaged_digests("gm").unwrap();
    assert_eq!(blames.len(), 1);
    assert_eq!(blames[0].total_untriaged_digests, 1);
    assert_eq!(blames[0].affected_groupings[0].sample_digest, digest(2));

    // And the aggregate paramset omits the hidden trace's values.
    let ps = engine.get_primary_branch_paramset("gm").unwrap();
    assert_eq!(ps["os"], vec!["linux".to_string()]);
}

#[test]
fn malformed_expectation_label_degrades_to_untriaged() {
    let fx = Fixture::new();
    fx.add_commits(&[1]);
    let (_, grouping) = fx.add_trace("bad", "gm", &[], &[(1, Some(digest(9)))]);
    fx.triage(grouping, digest(9), "x");
    let engine = fx.engine(1, &[]);

    let resp = engine.search(&untriaged_request()).unwrap();
    assert_eq!(resp.total, 1);
    assert_eq!(resp.results[0].status, Label::Untriaged);

    let resp = engine
        .get_cluster(&ClusterRequest {
            grouping,
            filter: gm_filter(),
            include_positive: false,
            include_negative: false,
            include_untriaged: true,
        })
        .unwrap();
    assert_eq!(resp.nodes.len(), 1);
    assert_eq!(resp.nodes[0].status, Label::Untriaged);
}

#[test]
fn empty_corpus_is_a_request_error() {
    let fx = Fixture::new();
    fx.add_commits(&[1]);
    let engine = fx.engine(1, &[]);
    let err = engine
        .search(&SearchRequest::default())
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<RequestError>(),
        Some(&RequestError::EmptyCorpus)
    );
}

#[test]
fn cluster_builds_nodes_and_edges() {
    let fx = Fixture::new();
    fx.add_commits(&[1]);
    let (_, grouping) = fx.add_trace("clu", "gm", &[("gpu", "amd")], &[(1, Some(digest(10)))]);
    fx.add_trace("clu", "gm", &[("gpu", "nvidia")], &[(1, Some(digest(30)))]);
    fx.triage(grouping, digest(10), "p");
    fx.add_diff(digest(10), digest(30), 4, 0.4);
    let engine = fx.engine(1, &[]);

    let resp = engine
        .get_cluster(&ClusterRequest {
            grouping,
            filter: gm_filter(),
            include_positive: true,
            include_negative: true,
            include_untriaged: true,
        })
        .unwrap();

    assert_eq!(resp.nodes.len(), 2);
    assert_eq!(resp.nodes[0].digest, digest(10));
    assert_eq!(resp.nodes[0].status, Label::Positive);
    assert_eq!(resp.nodes[1].status, Label::Untriaged);

    assert_eq!(resp.edges.len(), 1);
    assert_eq!((resp.edges[0].a, resp.edges[0].b), (0, 1));
    assert_eq!(resp.edges[0].distance, 0.4);

    let gpus = &resp.paramset["gpu"];
    assert_eq!(gpus, &vec!["amd".to_string(), "nvidia".to_string()]);
}

#[test]
fn cluster_status_filter_prunes_nodes() {
    let fx = Fixture::new();
    fx.add_commits(&[1]);
    let (_, grouping) = fx.add_trace("clu", "gm", &[("gpu", "amd")], &[(1, Some(digest(10)))]);
    fx.add_trace("clu", "gm", &[("gpu", "nvidia")], &[(1, Some(digest(30)))]);
    fx.triage(grouping, digest(10), "p");
    let engine = fx.engine(1, &[]);

    let resp = engine
        .get_cluster(&ClusterRequest {
            grouping,
            filter: gm_filter(),
            include_positive: false,
            include_negative: false,
            include_untriaged: true,
        })
        .unwrap();
    assert_eq!(resp.nodes.len(), 1);
    assert_eq!(resp.nodes[0].digest, digest(30));
}

#[test]
fn primary_paramset_aggregates_trace_and_test_keys() {
    let fx = three_result_fixture();
    let engine = fx.engine(3, &[]);

    let ps = engine.get_primary_branch_paramset("gm").unwrap();
    assert_eq!(
        ps["gpu"],
        vec!["amd".to_string(), "intel".to_string(), "nvidia".to_string()]
    );
    assert_eq!(ps["name"], vec!["square".to_string()]);

    // Second read is served from the TTL cache.
    let again = engine.get_primary_branch_paramset("gm").unwrap();
    assert_eq!(*ps, *again);
}

#[test]
fn window_and_grouping_digest_listings() {
    let fx = single_regression_fixture();
    let engine = fx.engine(3, &[]);

    // Window smaller than history: only the newest three commits.
    let commits = engine.get_commits_in_window().unwrap();
    let ids: Vec<_> = commits.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![3, 4, 5]);

    let grouping_params = util::params(&[("source_type", "gm"), ("name", "circle")]);
    let grouping = vtriage::model::types::GroupingId::from_params(&grouping_params);
    let digests = engine.get_digests_for_grouping(grouping).unwrap();
    assert_eq!(digests, vec![digest(10), digest(30)]);
}
