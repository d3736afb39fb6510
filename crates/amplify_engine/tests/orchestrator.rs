mod common;

use std::fs;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use amplify_core::{Action, ActionKind, JobStage, Step};
use amplify_engine::{
    ChannelProgressSink, ConvertRequest, Converter, EngineEvent, EngineConfig, FetchSettings, HookRegistry, JobError,
    ReqwestFetcher, StyleResponse, WaitUntil, FINAL_HTML, FINAL_SCREENSHOT, FINAL_VALIDATION,
    ORIGINAL_HTML,
};
use common::{FakeLauncher, FakeValidator, PageScript, RecordingSink};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SOURCE_URL: &str = "http://example.com/articles/42";
const SOURCE_HTML: &str = "<!DOCTYPE html><html><head><title>Story</title></head>\
    <body><div class=\"ad\" onclick=\"track()\">X</div><img src=\"a.png\"></body></html>";

struct Fixture {
    _temp: TempDir,
    config: EngineConfig,
    launcher: Arc<FakeLauncher>,
    validator: Arc<FakeValidator>,
    sink: Arc<RecordingSink>,
}

impl Fixture {
    fn new(script: PageScript) -> Self {
        engine_logging::initialize_for_tests();
        let temp = TempDir::new().unwrap();
        let config = EngineConfig {
            output_root: temp.path().to_path_buf(),
            validate_from_step: 0,
            ..EngineConfig::default()
        };
        Self {
            _temp: temp,
            config,
            launcher: Arc::new(FakeLauncher::new(script)),
            validator: Arc::new(FakeValidator::with_rule(
                "<img",
                5,
                "The tag 'img' may only appear as a descendant of tag 'noscript'. Did you mean 'amp-img'?",
            )),
            sink: Arc::new(RecordingSink::default()),
        }
    }

    fn converter(&self) -> Converter {
        Converter::new(
            self.config.clone(),
            self.launcher.clone(),
            self.validator.clone(),
            HookRegistry::with_builtins(),
            Arc::new(ReqwestFetcher::new(FetchSettings::default())),
            self.sink.clone(),
        )
    }
}

fn source_script() -> PageScript {
    PageScript {
        source_html: SOURCE_HTML.to_string(),
        ..PageScript::default()
    }
}

fn cleanup_steps() -> Vec<Step> {
    vec![
        Step::new(
            "Remove scripts",
            vec![Action::new(ActionKind::RemoveAttribute {
                selector: "div[onclick]".into(),
                attribute: "onclick".into(),
            })],
        ),
        Step::new(
            "Canonical",
            vec![Action::new(ActionKind::ReplaceOrInsert {
                selector: "head".into(),
                regex: "<link rel=\"canonical\"[^>]*>".into(),
                replace: "<link rel=\"canonical\" href=\"$URL\">".into(),
                canonical_link: true,
            })],
        ),
    ]
}

#[tokio::test]
async fn conversion_writes_every_artifact() {
    let fixture = Fixture::new(source_script());
    let converter = fixture.converter();

    let outcome = converter
        .convert(
            &ConvertRequest::new(SOURCE_URL),
            &cleanup_steps(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let dir = fixture.config.output_root.join("42");
    assert_eq!(outcome.output_dir, dir);
    assert_eq!(fs::read_to_string(dir.join(ORIGINAL_HTML)).unwrap(), SOURCE_HTML);
    assert_eq!(
        fs::read_to_string(dir.join(FINAL_HTML)).unwrap(),
        outcome.final_html
    );
    assert!(!fs::read(dir.join(FINAL_SCREENSHOT)).unwrap().is_empty());
    assert_eq!(
        fs::read_to_string(dir.join(FINAL_VALIDATION)).unwrap(),
        "line 5, col 0: The tag 'img' may only appear as a descendant of tag 'noscript'. \
         Did you mean 'amp-img'?"
    );

    assert!(!outcome.final_html.contains("onclick"));
    assert_eq!(outcome.final_html.matches("rel=\"canonical\"").count(), 1);
    assert!(outcome
        .final_html
        .contains("href=\"http://example.com/articles/42\""));
    assert!(!outcome.validation.pass);
    assert_eq!(outcome.dimensions.width, 411);
}

#[tokio::test]
async fn the_page_renders_from_the_local_mirror() {
    let fixture = Fixture::new(source_script());
    let converter = fixture.converter();

    converter
        .convert(
            &ConvertRequest::new(SOURCE_URL),
            &cleanup_steps(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let (gotos, mirror_status, opened, closed) = {
        let log = fixture.launcher.log.lock().unwrap();
        (
            log.gotos.clone(),
            log.mirror_status,
            log.pages_opened,
            log.pages_closed,
        )
    };
    assert_eq!(gotos.len(), 2);
    assert_eq!(gotos[0], (SOURCE_URL.to_string(), WaitUntil::NetworkIdle));
    let (mirror, wait) = &gotos[1];
    assert!(mirror.starts_with("http://127.0.0.1:"));
    assert!(mirror.ends_with("/output-original.html"));
    assert_eq!(*wait, WaitUntil::DomContentLoaded);
    assert_eq!(mirror_status, Some(200));
    assert_eq!((opened, closed), (1, 1));
}

#[tokio::test]
async fn progress_runs_from_initializing_to_closed() {
    let fixture = Fixture::new(source_script());
    let converter = fixture.converter();

    converter
        .convert(
            &ConvertRequest::new(SOURCE_URL),
            &cleanup_steps(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(
        fixture.sink.stages(),
        vec![
            JobStage::Initializing,
            JobStage::CollectingStyles,
            JobStage::Navigated,
            JobStage::RunningSteps { step: 0, action: 0 },
            JobStage::RunningSteps { step: 1, action: 0 },
            JobStage::Finalizing,
            JobStage::Closed,
        ]
    );
}

#[tokio::test]
async fn progress_can_be_followed_through_a_channel() {
    let fixture = Fixture::new(source_script());
    let (sink, mut events) = ChannelProgressSink::channel();
    let converter = Converter::new(
        fixture.config.clone(),
        fixture.launcher.clone(),
        fixture.validator.clone(),
        HookRegistry::with_builtins(),
        Arc::new(ReqwestFetcher::new(FetchSettings::default())),
        Arc::new(sink),
    );

    converter
        .convert(
            &ConvertRequest::new(SOURCE_URL),
            &cleanup_steps(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    drop(converter);

    let mut stages = Vec::new();
    while let Some(EngineEvent::Progress(progress)) = events.recv().await {
        assert_eq!(progress.url, SOURCE_URL);
        stages.push(progress.stage);
    }
    assert_eq!(stages.first(), Some(&JobStage::Initializing));
    assert_eq!(stages.last(), Some(&JobStage::Closed));
}

#[tokio::test]
async fn collected_styles_skip_excluded_hosts_and_fall_back_to_fetching() {
    let css_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/late.css"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(".from-fallback{}", "text/css"))
        .mount(&css_server)
        .await;

    let script = PageScript {
        stylesheets: vec![
            StyleResponse {
                url: "https://www.example.com/site.css".to_string(),
                body: Some(".from-site{}".to_string()),
            },
            StyleResponse {
                url: "https://www.instagram.com/embed.css".to_string(),
                body: Some(".from-instagram{}".to_string()),
            },
            StyleResponse {
                url: format!("{}/late.css", css_server.uri()),
                body: None,
            },
        ],
        ..source_script()
    };
    let fixture = Fixture::new(script);
    let converter = fixture.converter();
    let steps = vec![Step::new(
        "Inline styles",
        vec![Action::new(ActionKind::InlineExternalStyles {
            selector: "head".into(),
            minify: false,
        })],
    )];

    let outcome = converter
        .convert(
            &ConvertRequest::new(SOURCE_URL),
            &steps,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(outcome.final_html.contains(".from-site{}"));
    assert!(outcome.final_html.contains(".from-fallback{}"));
    assert!(!outcome.final_html.contains(".from-instagram"));
}

#[tokio::test]
async fn a_second_job_for_the_same_url_is_rejected_while_the_first_runs() {
    let fixture = Fixture::new(source_script());
    let converter = fixture.converter();
    let steps = cleanup_steps();
    let cancel = CancellationToken::new();
    let request = ConvertRequest::new(SOURCE_URL);

    let (first, second) = tokio::join!(
        converter.convert(&request, &steps, &cancel),
        converter.convert(&request, &steps, &cancel),
    );

    assert!(first.is_ok());
    assert!(matches!(second, Err(JobError::AlreadyRunning { .. })));

    // The slot is released once the first job is done.
    assert!(converter.convert(&request, &steps, &cancel).await.is_ok());
}

#[tokio::test]
async fn jobs_sharing_an_output_directory_do_not_run_together() {
    let fixture = Fixture::new(source_script());
    let converter = fixture.converter();
    let steps = cleanup_steps();
    let cancel = CancellationToken::new();
    let news = ConvertRequest::new("https://a.example/news/index");
    let blog = ConvertRequest::new("https://b.example/blog/index");

    let (first, second) = tokio::join!(
        converter.convert(&news, &steps, &cancel),
        converter.convert(&blog, &steps, &cancel),
    );

    assert!(first.is_ok());
    match second {
        Err(JobError::OutputInUse { output }) => assert_eq!(output, "index"),
        other => panic!("expected OutputInUse, got {other:?}"),
    }
    assert!(converter.convert(&blog, &steps, &cancel).await.is_ok());
}

#[tokio::test]
async fn cancelling_closes_the_mirror_without_waiting_for_a_slow_push() {
    let fixture = Fixture::new(PageScript {
        push_delay: Some(Duration::from_secs(2)),
        ..source_script()
    });
    let converter = fixture.converter();
    let cancel = CancellationToken::new();
    let log = fixture.launcher.log.clone();

    let cancel_during_push = async {
        while log.lock().unwrap().pushes.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let mirror = log.lock().unwrap().gotos[1].0.clone();
        let cancelled_at = Instant::now();
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let still_served = reqwest::get(&mirror).await.is_ok();
        (still_served, cancelled_at.elapsed())
    };
    let request = ConvertRequest::new(SOURCE_URL);
    let steps = cleanup_steps();
    let (result, (still_served, checked_after)) = tokio::join!(
        converter.convert(&request, &steps, &cancel),
        cancel_during_push,
    );

    assert!(checked_after < Duration::from_secs(2));
    assert!(!still_served);
    assert!(matches!(result, Err(JobError::Cancelled)));
    let dir = fixture.config.output_root.join("42");
    assert!(!dir.join(FINAL_HTML).exists());
    assert_eq!(fixture.launcher.log.lock().unwrap().pages_closed, 1);
    assert_eq!(fixture.sink.stages().last(), Some(&JobStage::Closed));
}

#[tokio::test]
async fn navigation_failure_ends_only_that_job() {
    let fixture = Fixture::new(PageScript {
        fail_navigation: true,
        ..source_script()
    });
    let converter = fixture.converter();

    let err = converter
        .convert(
            &ConvertRequest::new(SOURCE_URL),
            &cleanup_steps(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, JobError::Navigation(_)));
    let dir = fixture.config.output_root.join("42");
    assert!(!dir.join(FINAL_HTML).exists());
    assert_eq!(fixture.launcher.log.lock().unwrap().pages_closed, 1);
    assert_eq!(fixture.sink.stages().last(), Some(&JobStage::Closed));
}

#[tokio::test]
async fn a_failed_launch_is_retried_by_the_next_job() {
    let fixture = Fixture::new(source_script());
    fixture.launcher.fail_launch.store(true, Ordering::SeqCst);
    let converter = fixture.converter();
    let request = ConvertRequest::new(SOURCE_URL);
    let cancel = CancellationToken::new();

    let err = converter
        .convert(&request, &cleanup_steps(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::Launch(_)));

    fixture.launcher.fail_launch.store(false, Ordering::SeqCst);
    assert!(converter
        .convert(&request, &cleanup_steps(), &cancel)
        .await
        .is_ok());
    assert_eq!(fixture.launcher.launches(), 1);
}

#[tokio::test]
async fn cancelled_jobs_stop_before_the_mirror_starts() {
    let fixture = Fixture::new(source_script());
    let converter = fixture.converter();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = converter
        .convert(&ConvertRequest::new(SOURCE_URL), &cleanup_steps(), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, JobError::Cancelled));
    let dir = fixture.config.output_root.join("42");
    assert!(dir.join(ORIGINAL_HTML).exists());
    assert!(!dir.join(FINAL_HTML).exists());
    let log = fixture.launcher.log.lock().unwrap();
    assert_eq!(log.gotos.len(), 1);
    assert_eq!(log.pages_closed, 1);
}

#[tokio::test]
async fn output_override_names_the_job_directory() {
    let fixture = Fixture::new(source_script());
    let converter = fixture.converter();

    let outcome = converter
        .convert(
            &ConvertRequest::new(SOURCE_URL).with_output("story"),
            &cleanup_steps(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.output_dir, fixture.config.output_root.join("story"));
    assert!(outcome.output_dir.join(FINAL_HTML).exists());
}

#[tokio::test]
async fn invalid_urls_are_rejected_before_any_work() {
    let fixture = Fixture::new(source_script());
    let converter = fixture.converter();

    let err = converter
        .convert(
            &ConvertRequest::new("http://"),
            &cleanup_steps(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, JobError::InvalidUrl(_)));
    assert_eq!(fixture.launcher.launches(), 0);
    assert!(fixture.sink.stages().is_empty());
}

#[tokio::test]
async fn shutdown_closes_the_browser() {
    let fixture = Fixture::new(source_script());
    let converter = fixture.converter();
    let request = ConvertRequest::new(SOURCE_URL);
    let cancel = CancellationToken::new();

    converter
        .convert(&request, &cleanup_steps(), &cancel)
        .await
        .unwrap();
    converter.shutdown().await;
    converter
        .convert(&request, &cleanup_steps(), &cancel)
        .await
        .unwrap();

    assert_eq!(fixture.launcher.launches(), 2);
}
