use crate::{
    AnalyticsSource, BackupError, Config, DateWindow, Pipeline, ReportDataset, ReportKind,
    SearchConsole,
    api::{SiteEntry, verified_site_urls},
    auth::{
        AuthState, ClientSecret, ConsentPrompt, OOB_REDIRECT_URI, StoredToken, TokenEndpoint,
        TokenResponse, TokenStore, obtain_token,
    },
    pipeline::site_name_from_url,
    report::{QueryRequest, ReportRow},
};
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use gsc_core::{CellValue, Workbook};
use pretty_assertions::assert_eq;
use std::{cell::RefCell, collections::HashMap, path::Path};
use url::Url;

const SITE_URL: &str = "https://www.example.com/";

fn clock() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 10, 5, 0, 0).unwrap()
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn row(keys: &[Option<&str>], metrics: [Option<f64>; 4]) -> ReportRow {
    let [clicks, ctr, impressions, position] = metrics;
    ReportRow {
        keys: keys.iter().map(|k| k.map(str::to_owned)).collect(),
        clicks,
        ctr,
        impressions,
        position,
    }
}

fn full(keys: &[&str], clicks: f64, impressions: f64) -> ReportRow {
    let keys: Vec<Option<&str>> = keys.iter().map(|k| Some(*k)).collect();
    row(
        &keys,
        [Some(clicks), Some(0.25), Some(impressions), Some(3.5)],
    )
}

fn sheet_rows(path: &Path, sheet: &str) -> Vec<Vec<String>> {
    Workbook::open(path).unwrap().rows(sheet).unwrap()
}

// ---------------------------------------------------------------- config

#[test]
fn config_defaults_fill_everything_but_sites() {
    let config = Config::from_toml(
        r#"
        [sites]
        example = "https://www.example.com/"
        "#,
    )
    .unwrap();

    assert_eq!(config.sites["example"], SITE_URL);
    assert!(!config.discover_verified_sites);
    assert_eq!(config.credentials, Path::new("appengine/credentials.json"));
    assert_eq!(config.output_dir, Path::new("data"));
    assert_eq!((config.offset_days, config.span_days), (4, 1));
    assert_eq!(config.timezone, chrono_tz::US::Pacific);
    assert_eq!(config.search_type, "web");
    assert_eq!(config.row_limit, 5000);
    assert_eq!(
        config.reports,
        vec![
            ReportKind::ByDate,
            ReportKind::ByPageDate,
            ReportKind::ByQueryDate,
            ReportKind::ByQueryDatePage,
        ]
    );
    assert!(config.write_headers);
    assert_eq!(
        config.workbook_path("example"),
        Path::new("data/example-gsc-data-backup.xlsx")
    );
}

#[test]
fn shipped_example_config_is_valid() {
    let config = Config::from_toml(include_str!("../gsc-backup.example.toml")).unwrap();
    assert_eq!(config.sites.len(), 1);
    assert_eq!(config.reports, Config::default().reports);
}

#[test]
fn config_reads_report_kinds_in_kebab_case() {
    let config = Config::from_toml(
        r#"
        discover_verified_sites = true
        reports = ["by-device", "by-query-date-page"]
        "#,
    )
    .unwrap();
    assert_eq!(
        config.reports,
        vec![ReportKind::ByDevice, ReportKind::ByQueryDatePage]
    );
}

#[test]
fn config_rejects_unusable_values() {
    let cases = [
        "",
        "discover_verified_sites = true\nrow_limit = 0",
        "discover_verified_sites = true\nspan_days = 0",
        "discover_verified_sites = true\nreports = []",
        "discover_verified_sites = true\ntimezone = \"Mars/Olympus\"",
        "[sites]\n\"a/b\" = \"https://a.example/\"",
        "[sites]\nblank = \"  \"",
        "discover_verified_sites = true\nunknown_key = 1",
        "reports = [\"by-week\"]",
    ];
    for raw in cases {
        let err = Config::from_toml(raw).unwrap_err();
        assert!(
            matches!(err, BackupError::Config { .. }),
            "{raw:?} gave {err:?}"
        );
    }
}

#[test]
fn window_takes_today_in_the_configured_zone() {
    // 05:00 UTC on the 10th is still the 9th in Pacific time.
    let config = Config::default();
    let window = DateWindow::from_clock(clock(), &config).unwrap();
    assert_eq!(window.start, date(2024, 3, 5));
    assert_eq!(window.end, date(2024, 3, 5));

    let utc = Config {
        timezone: chrono_tz::UTC,
        ..Config::default()
    };
    let window = DateWindow::from_clock(clock(), &utc).unwrap();
    assert_eq!(window.end, date(2024, 3, 6));
}

#[test]
fn window_follows_daylight_saving_time() {
    // 07:30 UTC on July 1st is 00:30 PDT: already July 1st locally.
    let summer_night = Utc.with_ymd_and_hms(2026, 7, 1, 7, 30, 0).unwrap();
    let window = DateWindow::from_clock(summer_night, &Config::default()).unwrap();
    assert_eq!(window.end, date(2026, 6, 27));

    // Same wall-clock moment in winter is still the previous day at UTC-8.
    let winter_night = Utc.with_ymd_and_hms(2026, 1, 1, 7, 30, 0).unwrap();
    let window = DateWindow::from_clock(winter_night, &Config::default()).unwrap();
    assert_eq!(window.end, date(2025, 12, 27));
}

#[test]
fn timezone_is_read_by_name() {
    let config = Config::from_toml(
        "discover_verified_sites = true\ntimezone = \"Europe/Berlin\"",
    )
    .unwrap();
    assert_eq!(config.timezone, chrono_tz::Europe::Berlin);
}

#[test]
fn window_before_the_calendar_start_is_a_config_error() {
    let config = Config::from_toml(
        "discover_verified_sites = true\noffset_days = 4000000000",
    )
    .unwrap();
    let err = DateWindow::from_clock(clock(), &config).unwrap_err();
    assert!(matches!(err, BackupError::Config { context: "window", .. }), "{err:?}");

    let err = DateWindow::ending_before(date(2024, 3, 9), 0, u32::MAX).unwrap_err();
    assert!(matches!(err, BackupError::Config { context: "window", .. }), "{err:?}");
}

#[test]
fn window_spans_backwards_from_its_end() {
    let window = DateWindow::ending_before(date(2024, 3, 9), 4, 7).unwrap();
    assert_eq!(window.end, date(2024, 3, 5));
    assert_eq!(window.start, date(2024, 2, 28));
}

// ---------------------------------------------------------------- report

#[test]
fn query_body_is_camel_case() {
    let window = DateWindow::ending_before(date(2024, 3, 9), 4, 1).unwrap();
    let request = QueryRequest::new(ReportKind::ByQueryDatePage, &window, &Config::default());
    assert_eq!(
        serde_json::to_value(&request).unwrap(),
        serde_json::json!({
            "startDate": "2024-03-05",
            "endDate": "2024-03-05",
            "searchType": "web",
            "dimensions": ["query", "date", "page"],
            "rowLimit": 5000,
        })
    );
}

#[test]
fn every_kind_has_its_sheet_and_columns() {
    let expected = [
        (ReportKind::ByDate, "Data by Date", vec!["Date"]),
        (ReportKind::ByPageDate, "Data by Page Date", vec!["Page", "Date"]),
        (ReportKind::ByQueryDate, "Data by Query Date", vec!["Query", "Date"]),
        (ReportKind::ByDevice, "Data by Device", vec!["Platform"]),
        (
            ReportKind::ByQueryDatePage,
            "Data by Query Date Page",
            vec!["Query", "Date", "Page"],
        ),
    ];
    for (kind, sheet, dims) in expected {
        let mut columns = vec!["Clicks", "CTR", "Impressions", "Position"];
        columns.extend(dims);
        assert_eq!(kind.sheet_name(), sheet);
        assert_eq!(kind.columns(), columns);
    }
    assert_eq!(ReportKind::ALL.len(), 5);
}

#[test]
fn three_dimension_report_drops_incomplete_rows() {
    let rows = vec![
        full(&["bread", "2024-03-05", "https://www.example.com/a"], 4.0, 40.0),
        row(
            &[Some("butter"), None, Some("https://www.example.com/b")],
            [Some(1.0), Some(0.1), Some(10.0), Some(2.0)],
        ),
        row(
            &[Some("jam"), Some("2024-03-05"), Some("https://www.example.com/c")],
            [Some(1.0), None, Some(10.0), Some(2.0)],
        ),
        row(&[Some("toast"), Some("2024-03-05")], [Some(1.0); 4]),
    ];
    let dataset = ReportDataset::reshape(ReportKind::ByQueryDatePage, rows);

    assert_eq!(dataset.dropped, 3);
    assert_eq!(dataset.table.len(), 1);
    assert_eq!(
        dataset.table.rows[0],
        vec![
            CellValue::Number(4.0),
            CellValue::Number(0.25),
            CellValue::Int(40),
            CellValue::Number(3.5),
            CellValue::Text("bread".into()),
            CellValue::Text("2024-03-05".into()),
            CellValue::Text("https://www.example.com/a".into()),
        ]
    );
}

#[test]
fn other_reports_keep_incomplete_rows() {
    let rows = vec![
        row(&[], [Some(2.0), Some(0.5), Some(4.0), None]),
        row(&[None, Some("2024-03-05")], [Some(1.0); 4]),
    ];

    let by_date = ReportDataset::reshape(ReportKind::ByDate, rows[..1].to_vec());
    assert_eq!(by_date.dropped, 0);
    assert_eq!(
        by_date.table.rows[0],
        vec![
            CellValue::Number(2.0),
            CellValue::Number(0.5),
            CellValue::Int(4),
            CellValue::Empty,
            CellValue::Int(0),
        ]
    );

    let by_page = ReportDataset::reshape(ReportKind::ByPageDate, rows[1..].to_vec());
    assert_eq!(by_page.table.rows[0][4], CellValue::Int(0));
    assert_eq!(by_page.table.rows[0][5], CellValue::Text("2024-03-05".into()));
}

#[test]
fn report_rows_parse_from_api_json() {
    let raw = r#"{"keys":["bread","2024-03-05"],"clicks":3,"impressions":120,"ctr":0.025,"position":7.2}"#;
    let parsed: ReportRow = serde_json::from_str(raw).unwrap();
    assert_eq!(parsed, full(&["bread", "2024-03-05"], 3.0, 120.0).with_metrics(0.025, 7.2));
}

impl ReportRow {
    fn with_metrics(mut self, ctr: f64, position: f64) -> Self {
        self.ctr = Some(ctr);
        self.position = Some(position);
        self
    }
}

// ---------------------------------------------------------------- api

#[test]
fn only_verified_http_properties_are_kept() {
    let entry = |url: &str, level: &str| SiteEntry {
        site_url: url.into(),
        permission_level: level.into(),
    };
    let kept = verified_site_urls(vec![
        entry("https://www.example.com/", "siteOwner"),
        entry("http://blog.example.com/", "siteFullUser"),
        entry("https://pending.example.com/", "siteUnverifiedUser"),
        entry("sc-domain:example.com", "siteOwner"),
    ]);
    assert_eq!(
        kept,
        vec!["https://www.example.com/", "http://blog.example.com/"]
    );
}

#[test]
fn site_url_is_one_path_segment() {
    let console = SearchConsole::with_base("https://api.example.test/webmasters/v3/", "t").unwrap();
    let url = console
        .endpoint(&["sites", SITE_URL, "searchAnalytics", "query"])
        .unwrap();
    assert_eq!(
        url.as_str(),
        "https://api.example.test/webmasters/v3/sites/https:%2F%2Fwww.example.com%2F/searchAnalytics/query"
    );
}

#[test]
fn discovered_sites_are_named_by_host() {
    assert_eq!(
        site_name_from_url("https://www.example.com/").as_deref(),
        Some("www.example.com")
    );
    assert_eq!(site_name_from_url("sc-domain:example.com"), None);
}

// ---------------------------------------------------------------- auth

const SECRET_JSON: &str = r#"{"installed":{"client_id":"id-123.apps","client_secret":"s3cret","auth_uri":"https://accounts.example.test/auth","token_uri":"https://accounts.example.test/token","redirect_uris":["urn:ietf:wg:oauth:2.0:oob"]}}"#;

#[test]
fn client_secret_accepts_installed_and_web() {
    let installed = ClientSecret::from_json(SECRET_JSON.as_bytes()).unwrap();
    assert_eq!(installed.client_id, "id-123.apps");

    let web = ClientSecret::from_json(br#"{"web":{"client_id":"w","client_secret":"x"}}"#).unwrap();
    assert_eq!(web.token_uri, "https://oauth2.googleapis.com/token");

    assert!(matches!(
        ClientSecret::from_json(br#"{"other":{}}"#),
        Err(BackupError::Auth(_))
    ));
}

#[test]
fn consent_url_asks_for_offline_access() {
    let url = ClientSecret::from_json(SECRET_JSON.as_bytes())
        .unwrap()
        .consent_url()
        .unwrap();
    let query: HashMap<String, String> = url.query_pairs().into_owned().collect();
    assert_eq!(url.host_str(), Some("accounts.example.test"));
    assert_eq!(query["client_id"], "id-123.apps");
    assert_eq!(query["redirect_uri"], OOB_REDIRECT_URI);
    assert_eq!(query["access_type"], "offline");
    assert_eq!(
        query["scope"],
        "https://www.googleapis.com/auth/webmasters.readonly https://www.googleapis.com/auth/webmasters"
    );
}

#[derive(Default)]
struct FakeEndpoint {
    refresh_fails: bool,
    exchanged: RefCell<Vec<String>>,
    refreshed: RefCell<Vec<String>>,
}

impl TokenEndpoint for FakeEndpoint {
    fn consent_url(&self) -> Result<Url, BackupError> {
        Ok(Url::parse("https://accounts.example.test/auth?client_id=x")?)
    }

    fn exchange_code(&self, code: &str) -> Result<TokenResponse, BackupError> {
        self.exchanged.borrow_mut().push(code.to_owned());
        Ok(TokenResponse {
            access_token: format!("access-for-{code}"),
            expires_in: Some(3600),
            refresh_token: Some("refresh-1".into()),
            scope: None,
        })
    }

    fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, BackupError> {
        self.refreshed.borrow_mut().push(refresh_token.to_owned());
        if self.refresh_fails {
            return Err(BackupError::Api {
                status: 400,
                body: r#"{"error":"invalid_grant"}"#.into(),
            });
        }
        Ok(TokenResponse {
            access_token: "refreshed".into(),
            expires_in: Some(3600),
            refresh_token: None,
            scope: Some("a b".into()),
        })
    }
}

#[derive(Default)]
struct FakePrompt {
    shown: Vec<Url>,
}

impl ConsentPrompt for FakePrompt {
    fn authorization_code(&mut self, consent_url: &Url) -> Result<String, BackupError> {
        self.shown.push(consent_url.clone());
        Ok("code-42".into())
    }
}

fn stored(expires_at: DateTime<Utc>, refresh: Option<&str>) -> StoredToken {
    StoredToken {
        access_token: "stored".into(),
        refresh_token: refresh.map(str::to_owned),
        expires_at: Some(expires_at),
        scopes: vec![],
    }
}

#[test]
fn missing_credentials_run_the_consent_flow_and_persist() {
    let dir = tempfile::tempdir().unwrap();
    let store = TokenStore::new(dir.path().join("appengine/credentials.json"));
    let endpoint = FakeEndpoint::default();
    let mut prompt = FakePrompt::default();

    assert_eq!(AuthState::load(&store), AuthState::NoCredentials);
    let token = obtain_token(&endpoint, &mut prompt, &store, clock()).unwrap();

    assert_eq!(token.access_token, "access-for-code-42");
    assert_eq!(token.expires_at, Some(clock() + Duration::seconds(3600)));
    assert_eq!(prompt.shown.len(), 1);
    assert_eq!(store.load().unwrap(), token);

    // Second start: the stored token is used as is.
    let again = obtain_token(&endpoint, &mut prompt, &store, clock()).unwrap();
    assert_eq!(again, token);
    assert_eq!(prompt.shown.len(), 1);
    assert_eq!(endpoint.exchanged.borrow().len(), 1);
}

#[test]
fn corrupt_credentials_count_as_missing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("credentials.json");
    std::fs::write(&path, b"\x80\x03pickle").unwrap();
    assert_eq!(AuthState::load(&TokenStore::new(path)), AuthState::NoCredentials);
}

#[test]
fn expired_token_is_refreshed_and_keeps_its_refresh_token() {
    let dir = tempfile::tempdir().unwrap();
    let store = TokenStore::new(dir.path().join("credentials.json"));
    store
        .save(&stored(clock() - Duration::hours(1), Some("refresh-0")))
        .unwrap();
    let endpoint = FakeEndpoint::default();
    let mut prompt = FakePrompt::default();

    let token = obtain_token(&endpoint, &mut prompt, &store, clock()).unwrap();

    assert_eq!(token.access_token, "refreshed");
    assert_eq!(token.refresh_token.as_deref(), Some("refresh-0"));
    assert_eq!(token.scopes, vec!["a", "b"]);
    assert_eq!(*endpoint.refreshed.borrow(), vec!["refresh-0"]);
    assert!(prompt.shown.is_empty());
    assert_eq!(store.load().unwrap(), token);
}

#[test]
fn refused_refresh_falls_back_to_consent() {
    let dir = tempfile::tempdir().unwrap();
    let store = TokenStore::new(dir.path().join("credentials.json"));
    store
        .save(&stored(clock() - Duration::hours(1), Some("revoked")))
        .unwrap();
    let endpoint = FakeEndpoint {
        refresh_fails: true,
        ..FakeEndpoint::default()
    };
    let mut prompt = FakePrompt::default();

    let token = obtain_token(&endpoint, &mut prompt, &store, clock()).unwrap();

    assert_eq!(token.access_token, "access-for-code-42");
    assert_eq!(prompt.shown.len(), 1);
}

#[test]
fn token_close_to_expiry_counts_as_expired() {
    let token = stored(clock() + Duration::seconds(30), None);
    assert!(token.is_expired(clock()));
    assert!(!stored(clock() + Duration::hours(1), None).is_expired(clock()));
}

// ---------------------------------------------------------------- pipeline

struct FakeSource {
    verified: Vec<String>,
    rows: HashMap<ReportKind, Vec<ReportRow>>,
    requests: RefCell<Vec<(String, QueryRequest)>>,
}

impl FakeSource {
    fn new(verified: &[&str]) -> Self {
        let mut rows = HashMap::new();
        rows.insert(
            ReportKind::ByDate,
            vec![full(&["2024-03-05"], 12.0, 300.0)],
        );
        rows.insert(
            ReportKind::ByPageDate,
            vec![
                full(&["https://www.example.com/a", "2024-03-05"], 8.0, 100.0),
                full(&["https://www.example.com/b", "2024-03-05"], 4.0, 200.0),
            ],
        );
        rows.insert(
            ReportKind::ByQueryDate,
            vec![full(&["bread", "2024-03-05"], 5.0, 50.0)],
        );
        rows.insert(
            ReportKind::ByQueryDatePage,
            vec![
                full(&["bread", "2024-03-05", "https://www.example.com/a"], 5.0, 50.0),
                row(
                    &[Some("butter"), None, Some("https://www.example.com/b")],
                    [Some(1.0); 4],
                ),
            ],
        );
        rows.insert(ReportKind::ByDevice, vec![full(&["MOBILE"], 9.0, 90.0)]);
        Self {
            verified: verified.iter().map(|s| (*s).to_owned()).collect(),
            rows,
            requests: RefCell::new(Vec::new()),
        }
    }
}

impl AnalyticsSource for FakeSource {
    fn verified_sites(&self) -> Result<Vec<String>, BackupError> {
        Ok(self.verified.clone())
    }

    fn query(&self, site_url: &str, request: &QueryRequest) -> Result<Vec<ReportRow>, BackupError> {
        self.requests
            .borrow_mut()
            .push((site_url.to_owned(), request.clone()));
        let kind = ReportKind::ALL
            .into_iter()
            .find(|k| k.dimensions() == request.dimensions.as_slice())
            .unwrap();
        Ok(self.rows.get(&kind).cloned().unwrap_or_default())
    }
}

fn pipeline_config(output_dir: &Path) -> Config {
    let mut config = Config {
        output_dir: output_dir.to_path_buf(),
        ..Config::default()
    };
    config.sites.insert("example".into(), SITE_URL.into());
    config
}

fn window() -> DateWindow {
    DateWindow::ending_before(date(2024, 3, 9), 4, 1).unwrap()
}

#[test]
fn run_writes_one_workbook_with_a_sheet_per_report() {
    let dir = tempfile::tempdir().unwrap();
    let config = pipeline_config(dir.path());
    let source = FakeSource::new(&[SITE_URL]);

    let summary = Pipeline::new(&source, &config, window()).run().unwrap();

    let path = dir.path().join("example-gsc-data-backup.xlsx");
    assert_eq!(
        gsc_core::scan(&path).unwrap(),
        vec![
            "Data by Date",
            "Data by Page Date",
            "Data by Query Date",
            "Data by Query Date Page",
        ]
    );
    assert_eq!(
        sheet_rows(&path, "Data by Date"),
        vec![
            vec!["Clicks", "CTR", "Impressions", "Position", "Date"],
            vec!["12", "0.25", "300", "3.5", "2024-03-05"],
        ]
    );
    assert_eq!(
        sheet_rows(&path, "Data by Query Date Page"),
        vec![
            vec!["Clicks", "CTR", "Impressions", "Position", "Query", "Date", "Page"],
            vec!["5", "0.25", "50", "3.5", "bread", "2024-03-05", "https://www.example.com/a"],
        ]
    );

    let requests = source.requests.borrow();
    assert_eq!(requests.len(), 4);
    assert!(requests.iter().all(|(site, req)| site == SITE_URL
        && req.start_date == date(2024, 3, 5)
        && req.row_limit == 5000));

    let qdp = &summary.sheets[3];
    assert_eq!(
        (qdp.sheet, qdp.fetched, qdp.dropped, qdp.written),
        ("Data by Query Date Page", 2, 1, 2)
    );
    assert_eq!(summary.rows_written(), 2 + 3 + 2 + 2);
}

#[test]
fn second_run_appends_without_repeating_headers() {
    let dir = tempfile::tempdir().unwrap();
    let config = pipeline_config(dir.path());
    let source = FakeSource::new(&[SITE_URL]);
    let path = dir.path().join("example-gsc-data-backup.xlsx");

    Pipeline::new(&source, &config, window()).run().unwrap();
    let before = sheet_rows(&path, "Data by Page Date");
    let summary = Pipeline::new(&source, &config, window()).run().unwrap();
    let after = sheet_rows(&path, "Data by Page Date");

    assert_eq!(after.len(), 1 + 2 + 2);
    assert_eq!(after[..before.len()], before[..]);
    assert_eq!(after[3], before[1]);
    assert_eq!(summary.sheets[1].written, 2);
}

#[test]
fn device_report_is_written_only_when_enabled() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = pipeline_config(dir.path());
    config.reports = vec![ReportKind::ByDevice];
    config.write_headers = false;
    let source = FakeSource::new(&[SITE_URL]);

    Pipeline::new(&source, &config, window()).run().unwrap();

    let path = dir.path().join("example-gsc-data-backup.xlsx");
    assert_eq!(gsc_core::scan(&path).unwrap(), vec!["Data by Device"]);
    assert_eq!(
        sheet_rows(&path, "Data by Device"),
        vec![vec!["9", "0.25", "90", "3.5", "MOBILE"]]
    );
}

#[test]
fn empty_reports_leave_no_file_behind() {
    let dir = tempfile::tempdir().unwrap();
    let config = pipeline_config(dir.path());
    let mut source = FakeSource::new(&[SITE_URL]);
    source.rows.clear();

    let summary = Pipeline::new(&source, &config, window()).run().unwrap();

    assert_eq!(summary.rows_written(), 0);
    assert_eq!(summary.sheets.len(), 4);
    assert!(!dir.path().join("example-gsc-data-backup.xlsx").exists());
}

#[test]
fn discovery_adds_verified_sites_by_host() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = pipeline_config(dir.path());
    config.discover_verified_sites = true;
    config.reports = vec![ReportKind::ByDate];
    let source = FakeSource::new(&[SITE_URL, "https://shop.example.org/"]);

    let pipeline = Pipeline::new(&source, &config, window());
    let names: Vec<String> = pipeline.sites().unwrap().into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["example", "shop.example.org"]);

    pipeline.run().unwrap();
    assert!(dir.path().join("shop.example.org-gsc-data-backup.xlsx").exists());
}

#[test]
fn unverified_configured_site_is_still_backed_up() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = pipeline_config(dir.path());
    config.reports = vec![ReportKind::ByDate];
    let source = FakeSource::new(&[]);

    let summary = Pipeline::new(&source, &config, window()).run().unwrap();
    assert_eq!(summary.rows_written(), 2);
}

#[test]
fn source_errors_stop_the_run() {
    struct Failing;
    impl AnalyticsSource for Failing {
        fn verified_sites(&self) -> Result<Vec<String>, BackupError> {
            Ok(vec![SITE_URL.into()])
        }
        fn query(&self, _: &str, _: &QueryRequest) -> Result<Vec<ReportRow>, BackupError> {
            Err(BackupError::Api {
                status: 403,
                body: "forbidden".into(),
            })
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let config = pipeline_config(dir.path());
    let err = Pipeline::new(&Failing, &config, window()).run().unwrap_err();
    assert!(matches!(err, BackupError::Api { status: 403, .. }));
}
