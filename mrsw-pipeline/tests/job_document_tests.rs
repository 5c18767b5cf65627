//! Job document construction against a study tree on disk

use mrsw_common::config::TomlConfig;
use mrsw_common::Identity;
use mrsw_pipeline::layout::path_string;
use mrsw_pipeline::pipeline::{JobGenerationStage, SharedContext, Stage, StageContext};
use mrsw_pipeline::services::{JobDocumentBuilder, JobError, Notification, SettingsTemplate};
use mrsw_pipeline::StudyLayout;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const TEMPLATE: &str = r#"{
    "prerequisites": {"files": "*_svs.nii.gz", "files_ref": "*_ref.nii.gz"},
    "seqType": "unedited",
    "editTarget": ["none"]
}"#;

const NOTIFICATION: &str = r#"{"SourceEmail": "lab@example.org", "Password": "x"}"#;

/// `{temp}/study` as root with `{temp}/src` holding the shared configuration
struct Study {
    _temp: TempDir,
    root: PathBuf,
}

impl Study {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("study");
        fs::create_dir_all(root.join("raw")).unwrap();
        fs::create_dir_all(temp.path().join("src")).unwrap();
        fs::write(temp.path().join("src/OSPREY_master_settings.json"), TEMPLATE).unwrap();
        fs::write(temp.path().join("src/EmailConfig.json"), NOTIFICATION).unwrap();
        Self { _temp: temp, root }
    }

    fn touch(&self, relative: &str) {
        let path = self.root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"").unwrap();
    }

    fn layout(&self) -> StudyLayout {
        StudyLayout::new(&self.root, &TomlConfig::default())
    }

    fn template(&self) -> SettingsTemplate {
        SettingsTemplate::load(self.layout().settings_template()).unwrap()
    }

    fn notification(&self) -> Notification {
        Notification::load(self.layout().notification_config()).unwrap()
    }
}

fn identity(subject: &str, session: &str) -> Identity {
    Identity::new(subject, session).unwrap()
}

fn path_of(root: &Path, relative: &str) -> String {
    path_string(&root.join(relative))
}

#[test]
fn test_scans_and_refs_pair_by_position() {
    let study = Study::new();
    study.touch("bids/sub-01/ses-01/anat/sub-01_ses-01_T1w.nii.gz");
    study.touch("bids/sub-01/ses-01/mrs/B_svs.nii.gz");
    study.touch("bids/sub-01/ses-01/mrs/A_svs.nii.gz");
    study.touch("bids/sub-01/ses-01/mrs/A_ref.nii.gz");
    study.touch("bids/sub-01/ses-01/mrs/B_ref.nii.gz");

    let layout = study.layout();
    let job = JobDocumentBuilder::new(&layout)
        .build(&identity("sub-01", "ses-01"), &study.template(), &study.notification())
        .unwrap();

    let mrs = "bids/sub-01/ses-01/mrs";
    assert_eq!(
        job.document.files,
        vec![
            path_of(&study.root, &format!("{}/A_svs.nii.gz", mrs)),
            path_of(&study.root, &format!("{}/B_svs.nii.gz", mrs)),
        ]
    );
    assert_eq!(
        job.document.files_ref,
        vec![
            path_of(&study.root, &format!("{}/A_ref.nii.gz", mrs)),
            path_of(&study.root, &format!("{}/B_ref.nii.gz", mrs)),
        ]
    );
    let sidecars: Vec<&str> = job.runs.iter().map(|r| r.sidecar.as_str()).collect();
    assert_eq!(
        sidecars,
        vec![
            path_of(&study.root, &format!("{}/A_svs.json", mrs)),
            path_of(&study.root, &format!("{}/B_svs.json", mrs)),
        ]
    );
    assert_eq!(
        job.document.files_nii,
        vec![path_of(&study.root, "bids/sub-01/ses-01/anat/sub-01_ses-01_T1w.nii.gz")]
    );
    assert_eq!(job.document.mailto_recipients, vec!["lab@example.org"]);
}

#[test]
fn test_first_anatomical_image_wins() {
    let study = Study::new();
    study.touch("bids/sub-01/ses-01/anat/sub-01_ses-01_run-2_T1w.nii.gz");
    study.touch("bids/sub-01/ses-01/anat/sub-01_ses-01_run-1_T1w.nii.gz");

    let layout = study.layout();
    let job = JobDocumentBuilder::new(&layout)
        .build(&identity("sub-01", "ses-01"), &study.template(), &study.notification())
        .unwrap();

    assert!(job.document.files_nii[0].ends_with("run-1_T1w.nii.gz"));
    assert!(job.document.files.is_empty());
}

#[test]
fn test_missing_anatomical_image() {
    let study = Study::new();
    study.touch("bids/sub-01/ses-01/mrs/A_svs.nii.gz");
    study.touch("bids/sub-01/ses-01/mrs/A_ref.nii.gz");

    let layout = study.layout();
    let result = JobDocumentBuilder::new(&layout).build(
        &identity("sub-01", "ses-01"),
        &study.template(),
        &study.notification(),
    );

    assert!(matches!(result, Err(JobError::NoAnatomicalImage { .. })));
}

#[test]
fn test_count_mismatch_rejected() {
    let study = Study::new();
    study.touch("bids/sub-01/ses-01/anat/sub-01_ses-01_T1w.nii");
    study.touch("bids/sub-01/ses-01/mrs/A_svs.nii.gz");
    study.touch("bids/sub-01/ses-01/mrs/B_svs.nii.gz");
    study.touch("bids/sub-01/ses-01/mrs/A_ref.nii.gz");

    let layout = study.layout();
    let result = JobDocumentBuilder::new(&layout).build(
        &identity("sub-01", "ses-01"),
        &study.template(),
        &study.notification(),
    );

    assert!(matches!(
        result,
        Err(JobError::ScanRefCountMismatch { scans: 2, refs: 1, .. })
    ));
}

#[test]
fn test_alternate_spectroscopy_dir_and_sessionless_subject() {
    let study = Study::new();
    study.touch("bids/sub-02/anat/sub-02_T1w.nii.gz");
    study.touch("bids/sub-02/extra_data/A_svs.nii.gz");
    study.touch("bids/sub-02/extra_data/A_ref.nii.gz");

    let layout = study.layout();
    let id = identity("sub-02", "ses-01");
    let job = JobDocumentBuilder::new(&layout)
        .build(&id, &study.template(), &study.notification())
        .unwrap();

    assert_eq!(job.document.files.len(), 1);
    assert!(job.document.files[0].contains("/bids/sub-02/extra_data/"));
    assert_eq!(job.path, study.root.join("bids/sub-02/sub-02_ses-01_job.json"));
    assert_eq!(
        job.output_dir,
        study.root.join("bids/derivatives/sub-02/ses-01")
    );
}

#[test]
fn test_write_creates_output_dir_and_overwrites_job() {
    let study = Study::new();
    study.touch("bids/sub-01/ses-01/anat/sub-01_ses-01_T1w.nii.gz");
    study.touch("bids/sub-01/ses-01/mrs/A_svs.nii.gz");
    study.touch("bids/sub-01/ses-01/mrs/A_ref.nii.gz");
    let job_path = study.root.join("bids/sub-01/ses-01/sub-01_ses-01_job.json");
    fs::write(&job_path, "stale").unwrap();

    let layout = study.layout();
    let builder = JobDocumentBuilder::new(&layout);
    let job = builder
        .build(&identity("sub-01", "ses-01"), &study.template(), &study.notification())
        .unwrap();
    builder.write(&job).unwrap();

    assert!(study.root.join("bids/derivatives/sub-01/ses-01").is_dir());
    let value: Value = serde_json::from_str(&fs::read_to_string(&job_path).unwrap()).unwrap();
    let object = value.as_object().unwrap();
    assert!(!object.contains_key("prerequisites"));
    assert_eq!(object["seqType"], "unedited");
    assert_eq!(object["files"].as_array().unwrap().len(), 1);
    assert_eq!(
        object["outputFolder"][0],
        path_of(&study.root, "bids/derivatives/sub-01/ses-01").as_str()
    );
    assert_eq!(object["mailtoRecipients"][0], "lab@example.org");
}

#[tokio::test]
async fn test_job_stage_reports_failure_without_panicking() {
    let study = Study::new();
    study.touch("bids/sub-01/ses-01/mrs/A_svs.nii.gz");
    study.touch("bids/sub-01/ses-01/mrs/A_ref.nii.gz");

    let shared = SharedContext {
        layout: study.layout(),
        tool_dir: PathBuf::from("/opt/osprey"),
        dry_run: false,
        cancel: CancellationToken::new(),
    };
    let id = identity("sub-01", "ses-01");
    let span = tracing::info_span!("identity");
    let ctx = StageContext {
        shared: &shared,
        identity: &id,
        span: &span,
    };

    assert!(!JobGenerationStage.execute(&ctx).await);
    assert!(!study.root.join("bids/sub-01/ses-01/sub-01_ses-01_job.json").exists());
}

#[tokio::test]
async fn test_job_stage_missing_template_is_failure() {
    let study = Study::new();
    study.touch("bids/sub-01/ses-01/anat/sub-01_ses-01_T1w.nii.gz");
    fs::remove_file(study.layout().settings_template()).unwrap();

    let shared = SharedContext {
        layout: study.layout(),
        tool_dir: PathBuf::from("/opt/osprey"),
        dry_run: false,
        cancel: CancellationToken::new(),
    };
    let id = identity("sub-01", "ses-01");
    let span = tracing::info_span!("identity");
    let ctx = StageContext {
        shared: &shared,
        identity: &id,
        span: &span,
    };

    assert!(!JobGenerationStage.execute(&ctx).await);
}
