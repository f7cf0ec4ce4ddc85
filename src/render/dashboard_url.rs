use url::Url;

use crate::error::DashReportError;
use crate::schedules::Schedule;

/// Kiosk-mode URL of the schedule's dashboard.
///
/// Any subpath of the base URL is kept (`https://host/grafana` renders
/// `https://host/grafana/d/<uid>`). Variables keep their order and may repeat.
pub fn build_dashboard_url(base_url: &str, schedule: &Schedule) -> Result<Url, DashReportError> {
    let mut url = Url::parse(base_url.trim()).map_err(|e| {
        DashReportError::Configuration(format!("invalid dashboard base URL '{}': {}", base_url, e))
    })?;
    if url.cannot_be_a_base() {
        return Err(DashReportError::Configuration(format!(
            "dashboard base URL '{}' cannot carry a path",
            base_url
        )));
    }

    let base_path = url.path().trim_end_matches('/').to_string();
    url.set_path(&format!("{}/d/{}", base_path, schedule.dashboard_uid));
    url.set_query(None);

    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("from", &schedule.range_from)
            .append_pair("to", &schedule.range_to)
            .append_pair("kiosk", "1")
            .append_pair("tz", &schedule.timezone);
        for variable in &schedule.variables {
            query.append_pair(&format!("var-{}", variable.name), &variable.value);
        }
        if let Some(panel_ids) = &schedule.panel_ids {
            for panel_id in panel_ids {
                query.append_pair("viewPanel", &panel_id.to_string());
            }
        }
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedules::{test_schedule, Variable};

    #[test]
    fn test_url_keeps_subpath_and_duplicate_variables() {
        let mut schedule = test_schedule(1, "url");
        schedule.dashboard_uid = "abc123".into();
        schedule.timezone = "Europe/Berlin".into();
        schedule.variables = vec![
            Variable::new("host", "web-1"),
            Variable::new("host", "web-2"),
        ];

        let url = build_dashboard_url("https://grafana.example.com/dna/", &schedule).unwrap();
        assert_eq!(url.path(), "/dna/d/abc123");

        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("from".into(), "now-7d".into()),
                ("to".into(), "now".into()),
                ("kiosk".into(), "1".into()),
                ("tz".into(), "Europe/Berlin".into()),
                ("var-host".into(), "web-1".into()),
                ("var-host".into(), "web-2".into()),
            ]
        );
    }

    #[test]
    fn test_root_base_url() {
        let schedule = test_schedule(1, "url");
        let url = build_dashboard_url("http://localhost:3000", &schedule).unwrap();
        assert!(url
            .as_str()
            .starts_with("http://localhost:3000/d/ops-overview?from=now-7d"));
    }

    #[test]
    fn test_bad_base_url_is_a_configuration_error() {
        let schedule = test_schedule(1, "url");
        assert!(matches!(
            build_dashboard_url("not a url", &schedule),
            Err(DashReportError::Configuration(_))
        ));
    }
}
