use amplify_core::{parse_pipeline, Action, ActionKind, JobIdentity, Step};
use pretty_assertions::assert_eq;

const PIPELINE: &str = r#"[
  {
    "name": "Head",
    "actions": [
      {
        "log": "Add canonical link.",
        "actionType": "replaceOrInsert",
        "selector": "head",
        "regex": "<link rel=\"canonical\"[^>]*>",
        "replace": "<link rel=\"canonical\" href=\"$URL\">"
      },
      {
        "actionType": "removeUnusedStyles",
        "selector": "style",
        "minify": true,
        "outputCSS": true,
        "waitAfterLoaded": 250
      }
    ]
  },
  { "name": "Skipped", "skip": true, "actions": [{ "actionType": "removeDisallowedAttribute" }] },
  { "name": "Empty" },
  { "name": "Future", "actions": [{ "actionType": "teleport", "selector": "body" }] }
]"#;

#[test]
fn decodes_steps_and_action_parameters() {
    let steps = parse_pipeline(PIPELINE).unwrap();
    assert_eq!(steps.len(), 4);

    let head = &steps[0];
    assert!(head.is_runnable());
    match &head.actions[0].kind {
        ActionKind::ReplaceOrInsert {
            selector,
            canonical_link,
            ..
        } => {
            assert_eq!(selector, "head");
            assert!(*canonical_link);
        }
        other => panic!("unexpected kind {other:?}"),
    }
    assert_eq!(head.actions[0].label(), "Add canonical link.");
    assert_eq!(
        head.actions[1].kind,
        ActionKind::RemoveUnusedStyles {
            selector: "style".to_string(),
            minify: true,
            output_css: true,
        }
    );
    assert_eq!(head.actions[1].wait_after_loaded, Some(250));
    assert_eq!(head.actions[1].label(), "removeUnusedStyles");

    assert!(!steps[1].is_runnable());
    assert!(!steps[2].is_runnable());
}

#[test]
fn unknown_kinds_decode_as_unsupported() {
    let steps = parse_pipeline(PIPELINE).unwrap();
    assert_eq!(
        steps[3].actions[0].kind,
        ActionKind::Unsupported {
            kind: "teleport".to_string()
        }
    );
}

#[test]
fn known_kind_with_missing_parameters_is_rejected() {
    let json = r#"[{ "name": "Broken", "actions": [{ "actionType": "insert" }] }]"#;
    let err = parse_pipeline(json).unwrap_err();
    assert!(err.to_string().contains("insert"), "{err}");
}

#[test]
fn placeholders_resolve_once_per_invocation() {
    let job = JobIdentity::new("https://example.com/articles/42?amp=1", None).unwrap();
    let action = Action::new(ActionKind::Insert {
        selector: "head".to_string(),
        value: "<a href=\"$URL\">$DOMAIN</a> <a href=\"$HOST/\">home</a>".to_string(),
    });
    let resolved = action.resolved(&job.placeholders);
    assert_eq!(
        resolved.kind,
        ActionKind::Insert {
            selector: "head".to_string(),
            value: "<a href=\"https://example.com/articles/42\">example.com</a> \
                    <a href=\"https://example.com/\">home</a>"
                .to_string(),
        }
    );
    // The stored action keeps its tokens for the next job.
    assert!(matches!(&action.kind, ActionKind::Insert { value, .. } if value.contains("$URL")));
}

#[test]
fn substituted_values_are_not_rescanned() {
    let job = JobIdentity::new("https://example.com/$URL", None).unwrap();
    let action = Action::new(ActionKind::SetAttribute {
        selector: "a".to_string(),
        attribute: "href".to_string(),
        value: "$URL".to_string(),
    });
    match action.resolved(&job.placeholders).kind {
        ActionKind::SetAttribute { value, .. } => {
            assert_eq!(value, "https://example.com/$URL");
        }
        other => panic!("unexpected kind {other:?}"),
    }
}

#[test]
fn steps_can_be_built_in_code() {
    let step = Step::new(
        "Only",
        vec![Action::new(ActionKind::RemoveDisallowedAttribute).with_log("Strip attributes")],
    );
    assert!(step.is_runnable());
    assert_eq!(step.actions[0].label(), "Strip attributes");
}
