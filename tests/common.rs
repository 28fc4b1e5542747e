use gumdrop::Options;
use httpmock::{Mock, MockServer};
use std::sync::Arc;

use skein::prelude::*;

pub const INDEX_PATH: &str = "/";
pub const ABOUT_PATH: &str = "/about.html";

/// Not all functions are used by all tests, so we enable allow(dead_code) to avoid
/// compiler warnings during testing.

/// The following options are configured by default, if not set to a custom value:
///  --patrol-interval 1s
///  --no-print-report
///  --quiet
pub fn build_configuration(custom: Vec<&str>) -> SkeinConfiguration {
    let mut configuration: Vec<&str> = vec![];
    configuration.extend_from_slice(&custom);

    if !configuration.contains(&"--patrol-interval") && !configuration.contains(&"--worker") {
        configuration.extend_from_slice(&["--patrol-interval", "1s"]);
    }
    if !configuration.contains(&"--no-print-report") {
        configuration.push("--no-print-report");
    }
    if !configuration.contains(&"-q") {
        configuration.push("-q");
    }

    SkeinConfiguration::parse_args_default(&configuration)
        .expect("failed to parse options and generate a configuration")
}

/// Mock a fast `200` response for both test paths.
#[allow(dead_code)]
pub fn setup_mock_server_endpoints(server: &MockServer) -> (Mock, Mock) {
    let index = server.mock(|when, then| {
        when.method(httpmock::Method::GET).path(INDEX_PATH);
        then.status(200).body("index");
    });
    let about = server.mock(|when, then| {
        when.method(httpmock::Method::GET).path(ABOUT_PATH);
        then.status(200).body("about");
    });
    (index, about)
}

/// Attack the index three times as often as the about page.
#[allow(dead_code)]
pub fn build_load_test(server: &MockServer, configuration: SkeinConfiguration) -> SkeinAttack {
    SkeinAttack::initialize_with_config(configuration)
        .expect("failed to initialize")
        .register_attacker(
            Arc::new(HttpAttacker::new("index", &server.url(INDEX_PATH)).expect("invalid url")),
            3,
        )
        .expect("failed to register index")
        .register_attacker(
            Arc::new(HttpAttacker::new("about", &server.url(ABOUT_PATH)).expect("invalid url")),
            1,
        )
        .expect("failed to register about")
}

/// Total requests and failures across every attacker in a report.
#[allow(dead_code)]
pub fn total_results(report: &SummaryReport) -> u64 {
    report
        .reports
        .values()
        .map(|attack| attack.requests + attack.failures)
        .sum()
}
