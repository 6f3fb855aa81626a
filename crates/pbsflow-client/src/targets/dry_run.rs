use super::{JobInfo, ResourceManager, SubmitRequest};
use crate::error::Result;
use pbsflow_core::model::JobRef;
use std::sync::atomic::{AtomicU64, Ordering};

/// Hands out synthetic job ids and never contacts a cluster.
#[derive(Debug, Default)]
pub struct DryRun {
    next: AtomicU64,
}

impl DryRun {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResourceManager for DryRun {
    fn name(&self) -> &str {
        "dry-run"
    }

    fn submits(&self) -> bool {
        false
    }

    fn submit(&self, request: &SubmitRequest<'_>) -> Result<JobRef> {
        let n = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        let id = JobRef(format!("{}.dry-run", n));
        tracing::info!("[dry-run] {} -> {}", request.job_name, id);
        Ok(id)
    }

    fn release(&self, _jobs: &[JobRef]) -> Result<()> {
        Ok(())
    }

    fn delete(&self, _job: &JobRef) -> Result<()> {
        Ok(())
    }

    fn query(&self, _job: &JobRef) -> Result<Option<JobInfo>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_ids_are_sequential() {
        let rm = DryRun::new();
        let request = SubmitRequest {
            job_name: "a",
            script: Path::new("/a.sh"),
            hold: true,
            depends_on: &[],
            dependency_type: "afterok",
        };
        assert_eq!(rm.submit(&request).unwrap().0, "1.dry-run");
        assert_eq!(rm.submit(&request).unwrap().0, "2.dry-run");
        assert!(!rm.submits());
    }
}
