use pbsflow_core::{
    config::{ResourceRule, Resources},
    tool::ResourceRequest,
};
use wildmatch::WildMatch;

/// `#PBS` directive lines for a resource request.
pub fn pbs_directives(request: &ResourceRequest) -> Vec<String> {
    let mut lines = vec![format!("#PBS -l nodes=1:ppn={}", request.threads.max(1))];
    if let Some(w) = &request.walltime {
        lines.push(format!("#PBS -l walltime={}", w));
    }
    if let Some(m) = &request.mem {
        lines.push(format!("#PBS -l mem={}", m));
    }
    if let Some(q) = &request.queue {
        lines.push(format!("#PBS -q {}", q));
    }
    for opt in &request.extra {
        lines.push(format!("#PBS {}", opt));
    }
    lines
}

fn fill_defaults(current: &mut ResourceRequest, resources: &Resources, queue: Option<&str>) {
    let d = &resources.defaults;
    if current.walltime.is_none() {
        current.walltime = d.walltime.clone();
    }
    if current.mem.is_none() {
        current.mem = d.mem.clone();
    }
    if current.queue.is_none() {
        current.queue = d.queue.clone().or_else(|| queue.map(str::to_string));
    }
    if current.extra.is_empty() {
        current.extra = d.qsub_opts.clone();
    }
}

fn merge_rule(current: &mut ResourceRequest, rule: &ResourceRule) {
    if let Some(val) = rule.threads {
        current.threads = val;
    }
    if let Some(val) = &rule.walltime {
        current.walltime = Some(val.clone());
    }
    if let Some(val) = &rule.mem {
        current.mem = Some(val.clone());
    }
    if let Some(val) = &rule.queue {
        current.queue = Some(val.clone());
    }
    if !rule.qsub_opts.is_empty() {
        current.extra = rule.qsub_opts.clone();
    }
}

/// Tool request, then configured defaults for anything it left open, then
/// every matching rule in order.
pub fn resolve_for_tool(
    tool_name: &str,
    requested: &ResourceRequest,
    resources: &Option<Resources>,
    default_queue: Option<&str>,
) -> ResourceRequest {
    let mut current = requested.clone();
    if current.queue.is_none() {
        current.queue = default_queue.map(str::to_string);
    }

    if let Some(r) = resources {
        if current.threads == 0 {
            current.threads = r.defaults.threads.unwrap_or(1);
        }
        fill_defaults(&mut current, r, default_queue);
        for rule in &r.rules {
            let matches = rule
                .tool_glob
                .as_ref()
                .is_none_or(|glob| WildMatch::new(glob).matches(tool_name));
            if matches {
                merge_rule(&mut current, rule);
            }
        }
    }

    tracing::debug!(
        "Resolved resources for tool '{}': {:?}",
        tool_name,
        current
    );
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_test_resources() -> Resources {
        toml::from_str(
            r#"
[defaults]
threads = 1
mem = "1gb"
walltime = "01:00:00"
queue = "batch"

[[rules]]
tool_glob = "bwa*"
mem = "16gb"
threads = 8

[[rules]]
tool_glob = "*gpu*"
queue = "gpu"
qsub_opts = ["-l gpus=1"]
"#,
        )
        .unwrap()
    }

    fn request(threads: u32) -> ResourceRequest {
        ResourceRequest {
            threads,
            ..ResourceRequest::default()
        }
    }

    #[test]
    fn test_defaults_fill_gaps() {
        let res = Some(get_test_resources());
        let resolved = resolve_for_tool("cat", &request(2), &res, None);
        assert_eq!(resolved.threads, 2);
        assert_eq!(resolved.mem, Some("1gb".into()));
        assert_eq!(resolved.walltime, Some("01:00:00".into()));
        assert_eq!(resolved.queue, Some("batch".into()));
    }

    #[test]
    fn test_tool_request_beats_defaults() {
        let res = Some(get_test_resources());
        let req = ResourceRequest {
            threads: 1,
            walltime: Some("12:00:00".into()),
            ..ResourceRequest::default()
        };
        let resolved = resolve_for_tool("cat", &req, &res, None);
        assert_eq!(resolved.walltime, Some("12:00:00".into()));
    }

    #[test]
    fn test_rules_override_tool_request() {
        let res = Some(get_test_resources());
        let req = ResourceRequest {
            threads: 4,
            mem: Some("2gb".into()),
            ..ResourceRequest::default()
        };
        let resolved = resolve_for_tool("bwa_mem", &req, &res, None);
        assert_eq!(resolved.threads, 8);
        assert_eq!(resolved.mem, Some("16gb".into()));
    }

    #[test]
    fn test_glob_mismatch_keeps_defaults() {
        let res = Some(get_test_resources());
        let resolved = resolve_for_tool("samtools", &request(1), &res, None);
        assert_eq!(resolved.queue, Some("batch".into()));
        assert!(resolved.extra.is_empty());
    }

    #[test]
    fn test_config_queue_used_without_resources() {
        let resolved = resolve_for_tool("cat", &request(1), &None, Some("long"));
        assert_eq!(resolved.queue, Some("long".into()));
    }

    #[test]
    fn test_directives_render() {
        let res = Some(get_test_resources());
        let resolved = resolve_for_tool("gpu_caller", &request(2), &res, None);
        assert_eq!(
            pbs_directives(&resolved),
            vec![
                "#PBS -l nodes=1:ppn=2",
                "#PBS -l walltime=01:00:00",
                "#PBS -l mem=1gb",
                "#PBS -q gpu",
                "#PBS -l gpus=1",
            ]
        );
    }
}
