// crates/flowcore/tests/expression_test.rs

use chrono::{TimeZone, Utc};
use flowcore::expression::{self, FORBIDDEN_IDENTIFIERS, RESERVED_WORDS};
use flowcore::{ExpressionContext, ExpressionEngine, ExpressionErrorKind, ExpressionLimits, Value};
use serde_json::json;
use std::time::{Duration, Instant};
use uuid::Uuid;

fn engine() -> ExpressionEngine {
    ExpressionEngine::default()
}

fn ctx() -> ExpressionContext {
    ExpressionContext::new(json!({
        "a": 2,
        "b": 3,
        "name": "  Ada Lovelace ",
        "tags": ["x", "y", "x"],
        "items": [
            {"sku": "p1", "price": 10, "qty": 2},
            {"sku": "p2", "price": 4.5, "qty": 1},
            {"sku": "p3", "price": 7, "qty": 0}
        ],
        "user": {"email": null, "age": 36}
    }))
    .with_node_output("A", json!({"y": 5}))
    .with_node_output("Fetch Users", json!({"count": 3}))
    .with_now(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
}

fn eval(template: &str) -> Value {
    engine()
        .evaluate(template, &ctx())
        .unwrap_or_else(|e| panic!("{template}: {e}"))
}

fn error_kind(template: &str) -> ExpressionErrorKind {
    match engine().evaluate(template, &ctx()) {
        Ok(value) => panic!("{template} evaluated to {value}"),
        Err(e) => e.kind,
    }
}

#[test]
fn test_plain_strings_pass_through() {
    assert_eq!(eval("no expressions here"), json!("no expressions here"));
    assert_eq!(eval(""), json!(""));
}

#[test]
fn test_sole_block_returns_native_value() {
    assert_eq!(eval("{{ $json.a + $json.b }}"), json!(5));
    assert_eq!(eval("  {{ $json.items }}  "), ctx().json()["items"]);
    assert_eq!(eval("{{ $json.missing }}"), Value::Null);
}

#[test]
fn test_mixed_template_splices_strings() {
    assert_eq!(eval("sum={{ $json.a + $json.b }}!"), json!("sum=5!"));
    assert_eq!(eval("{{ $json.a }}{{ $json.b }}"), json!("23"));
    assert_eq!(eval("[{{ $json.missing }}]"), json!("[]"));
    assert_eq!(eval("tags: {{ $json.tags }}"), json!(r#"tags: ["x","y","x"]"#));
}

#[test]
fn test_node_reference_arithmetic() {
    assert_eq!(eval(r#"{{ $node["A"].y * 2 }}"#), json!(10));
    assert_eq!(eval(r#"{{ $node["Fetch Users"].count }}"#), json!(3));
}

#[test]
fn test_evaluation_is_idempotent() {
    let engine = engine();
    let ctx = ctx();
    let template = "{{ $json.a + $json.b }}";
    let first = engine.evaluate(template, &ctx).unwrap();
    let second = engine.evaluate(template, &ctx).unwrap();
    assert_eq!(first, second);

    let now_first = engine.evaluate("{{ $now }}", &ctx).unwrap();
    let now_second = engine.evaluate("{{ now() }}", &ctx).unwrap();
    assert_eq!(now_first, json!("2024-03-01T12:00:00.000Z"));
    assert_eq!(now_first, now_second);
}

#[test]
fn test_operator_precedence() {
    assert_eq!(eval("{{ 1 + 2 * 3 }}"), json!(7));
    assert_eq!(eval("{{ (1 + 2) * 3 }}"), json!(9));
    assert_eq!(eval("{{ 10 - 4 - 3 }}"), json!(3));
    assert_eq!(eval("{{ -$json.a * 2 }}"), json!(-4));
    assert_eq!(eval("{{ !false && 1 < 2 }}"), json!(true));
    assert_eq!(eval("{{ $json.a > 1 ? 'big' : 'small' }}"), json!("big"));
    assert_eq!(eval("{{ $json.user.email ?? 'none' }}"), json!("none"));
    assert_eq!(eval("{{ 0 || 'fallback' }}"), json!("fallback"));
    assert_eq!(eval("{{ 7 % 4 }}"), json!(3));
    assert_eq!(eval("{{ 1 == 1.0 }}"), json!(true));
}

#[test]
fn test_string_functions() {
    assert_eq!(eval("{{ trim($json.name) }}"), json!("Ada Lovelace"));
    assert_eq!(eval("{{ $json.name.trim().toUpperCase() }}"), json!("ADA LOVELACE"));
    assert_eq!(eval("{{ split('a,b,c', ',') }}"), json!(["a", "b", "c"]));
    assert_eq!(eval("{{ join($json.tags, '-') }}"), json!("x-y-x"));
    assert_eq!(eval("{{ 'abc'.length }}"), json!(3));
    assert_eq!(eval("{{ 'hello'.includes('ell') }}"), json!(true));
    assert_eq!(eval("{{ toFixed(3.14159, 2) }}"), json!("3.14"));
}

#[test]
fn test_collection_functions() {
    assert_eq!(eval("{{ $json.items.map(x => x.sku) }}"), json!(["p1", "p2", "p3"]));
    assert_eq!(
        eval("{{ $json.items.filter(x => x.qty > 0).length }}"),
        json!(2)
    );
    assert_eq!(
        eval("{{ reduce($json.items, (acc, x) => acc + x.price * x.qty, 0) }}"),
        json!(24.5)
    );
    assert_eq!(eval("{{ find($json.items, x => x.price < 5).sku }}"), json!("p2"));
    assert_eq!(eval("{{ unique($json.tags) }}"), json!(["x", "y"]));
    assert_eq!(eval("{{ sum([1, 2, 3]) }}"), json!(6));
    assert_eq!(eval("{{ keys($json.user) }}"), json!(["age", "email"]));
    assert_eq!(eval("{{ $json.items[-1].sku }}"), json!("p3"));
    assert_eq!(eval("{{ [1, 2] + [3] }}"), json!([1, 2, 3]));
    assert_eq!(eval("{{ {total: $json.a * 10, ok: true} }}"), json!({"total": 20, "ok": true}));
}

#[test]
fn test_math_date_and_hash_functions() {
    assert_eq!(eval("{{ round(2.5) }}"), json!(3));
    assert_eq!(eval("{{ max(1, 9, 4) }}"), json!(9));
    assert_eq!(eval("{{ abs(-3) }}"), json!(3));
    assert_eq!(eval("{{ dateAdd($now, 1, 'days') }}"), json!("2024-03-02T12:00:00.000Z"));
    assert_eq!(eval("{{ formatDate($now, '%Y/%m/%d') }}"), json!("2024/03/01"));
    assert_eq!(eval("{{ base64Encode('hello') }}"), json!("aGVsbG8="));
    assert_eq!(eval("{{ base64Decode('aGVsbG8=') }}"), json!("hello"));
    assert_eq!(eval("{{ md5('abc') }}"), json!("900150983cd24fb0d6963f7d28e17f72"));
    assert_eq!(
        eval("{{ sha256('abc') }}"),
        json!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
    );
    assert_eq!(eval("{{ typeOf($json.items) }}"), json!("array"));
    assert_eq!(eval("{{ jsonParse('{\"k\": 1}').k }}"), json!(1));
}

#[test]
fn test_eval_call_is_forbidden() {
    assert_eq!(
        error_kind(r#"{{ eval("1+1") }}"#),
        ExpressionErrorKind::ForbiddenConstruct
    );
    assert!(engine().check(r#"{{ eval("1+1") }}"#).is_err());
}

#[test]
fn test_every_forbidden_identifier_is_rejected() {
    for word in FORBIDDEN_IDENTIFIERS {
        let template = format!("{{{{ $json.{word} }}}}");
        assert_eq!(
            error_kind(&template),
            ExpressionErrorKind::ForbiddenConstruct,
            "{word} should be rejected"
        );
    }
}

#[test]
fn test_reserved_words_allowed_in_strings_and_properties() {
    for word in RESERVED_WORDS {
        let template = format!("{{{{ {word} }}}}");
        assert_eq!(
            error_kind(&template),
            ExpressionErrorKind::ForbiddenConstruct,
            "{word} should be rejected"
        );
    }

    assert_eq!(eval("{{ 'this is new' }}"), json!("this is new"));
    assert_eq!(eval("{{ $json.fs }}"), Value::Null);
    assert_eq!(eval(r#"{{ $json["window"] ?? 'none' }}"#), json!("none"));
    assert!(engine().check("{{ upper('fetch') }}").is_ok());
}

#[test]
fn test_forbidden_construct_variants() {
    for template in [
        "{{ $json.constructor.constructor('return 1')() }}",
        "{{ $json['__proto__'] }}",
        "{{ Function('x') }}",
        "{{ require('fs') }}",
        "{{ this }}",
        "{{ exec('ls') }}",
        "{{ $json.run() }}",
    ] {
        assert_eq!(
            error_kind(template),
            ExpressionErrorKind::ForbiddenConstruct,
            "{template}"
        );
    }
}

#[test]
fn test_computed_forbidden_key_fails_at_evaluation() {
    let template = r#"{{ $json["con" + "structor"] }}"#;
    assert!(engine().check(template).is_ok());
    assert_eq!(error_kind(template), ExpressionErrorKind::ForbiddenConstruct);
}

#[test]
fn test_forbidden_block_stops_the_whole_template() {
    let err = engine()
        .evaluate("ok {{ $json.a }} then {{ eval('1') }}", &ctx())
        .unwrap_err();
    assert_eq!(err.kind, ExpressionErrorKind::ForbiddenConstruct);
    assert!(err.offset >= 22);
}

#[test]
fn test_syntax_and_runtime_errors() {
    assert_eq!(error_kind("{{ $json.a + }}"), ExpressionErrorKind::SyntaxError);
    assert_eq!(error_kind("{{ $json.a "), ExpressionErrorKind::SyntaxError);
    assert_eq!(error_kind("{{ $secrets.key }}"), ExpressionErrorKind::SyntaxError);
    assert_eq!(error_kind("{{ $json.a = 1 }}"), ExpressionErrorKind::SyntaxError);
    assert_eq!(error_kind("{{ 1 / 0 }}"), ExpressionErrorKind::RuntimeError);
    assert_eq!(error_kind("{{ {} * 2 }}"), ExpressionErrorKind::RuntimeError);
    assert_eq!(error_kind("{{ upper(42) }}"), ExpressionErrorKind::RuntimeError);
}

#[test]
fn test_step_budget_is_enforced() {
    let limits = ExpressionLimits {
        max_steps: 5_000,
        ..ExpressionLimits::default()
    };
    let engine = ExpressionEngine::new(limits.clone());
    let template = "{{ range(0, 1000).map(i => range(0, 1000).length) }}";

    let started = Instant::now();
    let err = engine.evaluate(template, &ctx()).unwrap_err();
    assert_eq!(err.kind, ExpressionErrorKind::ResourceExceeded);
    assert!(started.elapsed() < Duration::from_millis(limits.max_duration_ms) + Duration::from_millis(500));
}

#[test]
fn test_wall_clock_budget_is_enforced() {
    let limits = ExpressionLimits {
        max_duration_ms: 20,
        max_steps: u64::MAX,
        ..ExpressionLimits::default()
    };
    let engine = ExpressionEngine::new(limits);
    let template = "{{ range(0, 10000).map(i => sha512(string(i)).length).length }}";
    let template = vec![template; 50].join(" ");

    let started = Instant::now();
    // A fast machine may finish inside the budget.
    if let Err(e) = engine.evaluate(&template, &ctx()) {
        assert_eq!(e.kind, ExpressionErrorKind::ResourceExceeded);
    }
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_size_limits() {
    let limits = ExpressionLimits {
        max_string_length: 64,
        max_collection_length: 10,
        ..ExpressionLimits::default()
    };
    let engine = ExpressionEngine::new(limits);
    let ctx = ctx();
    assert_eq!(
        engine.evaluate("{{ repeat('ab', 100) }}", &ctx).unwrap_err().kind,
        ExpressionErrorKind::ResourceExceeded
    );
    assert_eq!(
        engine.evaluate("{{ range(0, 50) }}", &ctx).unwrap_err().kind,
        ExpressionErrorKind::ResourceExceeded
    );
}

#[test]
fn test_resolve_config_walks_the_tree() {
    let config = json!({
        "url": "https://api.example.com/users/{{ $json.user.age }}",
        "body": {"total": "{{ $json.a * $json.b }}", "static": 1},
        "headers": ["X-Sku: {{ $json.items[0].sku }}"],
        "{{ key }}": "kept"
    });
    let resolved = engine().resolve_config(&config, &ctx()).unwrap();
    assert_eq!(resolved["url"], "https://api.example.com/users/36");
    assert_eq!(resolved["body"]["total"], 6);
    assert_eq!(resolved["body"]["static"], 1);
    assert_eq!(resolved["headers"][0], "X-Sku: p1");
    assert_eq!(resolved["{{ key }}"], "kept");
}

#[test]
fn test_resolve_config_error_names_path() {
    let config = json!({"body": {"total": "{{ 1 / 0 }}"}});
    let err = engine().resolve_config(&config, &ctx()).unwrap_err();
    assert_eq!(err.kind, ExpressionErrorKind::RuntimeError);
    assert!(err.message.contains("body.total"), "{}", err.message);
}

#[test]
fn test_context_variables() {
    let workflow_id = Uuid::new_v4();
    let execution_id = Uuid::new_v4();
    let started = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
    let mut env = serde_json::Map::new();
    env.insert("REGION".into(), json!("eu-west-1"));

    let ctx = ExpressionContext::default()
        .with_items(vec![json!({"n": 1}), json!({"n": 2})])
        .with_workflow(workflow_id, "billing")
        .with_execution(execution_id, started)
        .with_env(env);
    let engine = engine();

    assert_eq!(engine.evaluate("{{ $json.n }}", &ctx).unwrap(), json!(1));
    assert_eq!(engine.evaluate("{{ $items.map(i => i.n) }}", &ctx).unwrap(), json!([1, 2]));
    assert_eq!(engine.evaluate("{{ $workflow.name }}", &ctx).unwrap(), json!("billing"));
    assert_eq!(
        engine.evaluate("{{ $execution.id }}", &ctx).unwrap(),
        json!(execution_id.to_string())
    );
    assert_eq!(
        engine.evaluate("{{ $execution.startedAt }}", &ctx).unwrap(),
        json!("2024-01-02T03:04:05.000Z")
    );
    assert_eq!(engine.evaluate("{{ $env.REGION }}", &ctx).unwrap(), json!("eu-west-1"));
    assert_eq!(engine.evaluate("{{ $env.HOME }}", &ctx).unwrap(), Value::Null);
}

#[test]
fn test_free_function_matches_engine() {
    let limits = ExpressionLimits::default();
    let value = expression::evaluate("{{ $json.a * 4 }}", &ctx(), &limits).unwrap();
    assert_eq!(value, json!(8));
    assert!(expression::contains_expression("x {{ y }}"));
    assert!(!expression::contains_expression("x { y }"));
}
