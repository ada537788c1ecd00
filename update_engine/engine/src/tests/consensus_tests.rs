use serde_json::json;

use crate::consensus::{ConsensusOutcome, validate_consensus};
use crate::error::{ErrorCategory, UpdateError};
use crate::repository::{MemoryRepository, Updater};
use crate::types::{FileInfo, TargetInfo};

const FIRMWARE: &[u8] = b"firmware image for ECU 22222, rev. 1";

fn repositories() -> (MemoryRepository, MemoryRepository) {
    let director = MemoryRepository::new("director");
    let image = MemoryRepository::new("imagerepo");
    director.refresh().unwrap();
    image.refresh().unwrap();
    (director, image)
}

fn directed(filepaths: &[&str]) -> Vec<String> {
    filepaths.iter().map(|f| f.to_string()).collect()
}

#[test]
fn test_agreeing_repositories_produce_verified_target() {
    let (director, image) = repositories();
    let content = vec![b'x'; 37];
    let target = director.publish("/firmware.bin", &content, None);
    image.publish("/firmware.bin", &content, None);

    let report = validate_consensus(&directed(&["/firmware.bin"]), &director, &image);

    assert_eq!(report.verified_targets(), vec![target.clone()]);
    assert_eq!(report.verified_targets()[0].fileinfo.length, 37);
    assert!(report.failures().is_empty());
}

#[test]
fn test_length_mismatch_excludes_target() {
    let (director, image) = repositories();
    let content = vec![b'x'; 37];
    let target = director.publish("/firmware.bin", &content, None);

    let mut lying = target.fileinfo.clone();
    lying.length = 38;
    image.add_target(TargetInfo::new("/firmware.bin", lying));

    let report = validate_consensus(&directed(&["/firmware.bin"]), &director, &image);

    assert!(report.verified_targets().is_empty());
    let failures = report.failures();
    assert_eq!(failures.len(), 1);
    assert!(matches!(&failures[0], UpdateError::ConsensusMismatch { filepath } if filepath == "/firmware.bin"));
    assert_eq!(failures[0].category(), ErrorCategory::Consensus);
}

#[test]
fn test_hash_mismatch_excludes_target() {
    let (director, image) = repositories();
    director.publish("/firmware.bin", FIRMWARE, None);
    image.publish("/firmware.bin", b"firmware image for ECU 22222, rev. 2", None);

    let report = validate_consensus(&directed(&["/firmware.bin"]), &director, &image);

    assert!(report.verified_targets().is_empty());
    assert!(matches!(report.outcomes[0], ConsensusOutcome::Mismatch { .. }));
}

#[test]
fn test_custom_metadata_is_ignored() {
    let (director, image) = repositories();
    let target = director.publish("/firmware.bin", FIRMWARE, Some(json!({"ecu_serial": "22222"})));
    image.publish("/firmware.bin", FIRMWARE, Some(json!({"release": "beta"})));

    let report = validate_consensus(&directed(&["/firmware.bin"]), &director, &image);

    // The Director's descriptor, custom included, is the one kept.
    assert_eq!(report.verified_targets(), vec![target]);
}

#[test]
fn test_partial_failure_keeps_passing_targets() {
    let (director, image) = repositories();
    let first = director.publish("/firmware.bin", FIRMWARE, None);
    image.publish("/firmware.bin", FIRMWARE, None);
    director.publish("/missing.bin", b"only the director has this", None);

    let report = validate_consensus(&directed(&["/firmware.bin", "/missing.bin"]), &director, &image);

    assert_eq!(report.verified_targets(), vec![first]);
    let failures = report.failures();
    assert_eq!(failures.len(), 1);
    assert!(matches!(&failures[0], UpdateError::UnvalidatedTarget { filepath, .. } if filepath == "/missing.bin"));
}

#[test]
fn test_target_unknown_to_director_is_unvalidated() {
    let (director, image) = repositories();
    image.publish("/firmware.bin", FIRMWARE, None);

    let report = validate_consensus(&directed(&["/firmware.bin"]), &director, &image);
    assert!(matches!(report.outcomes[0], ConsensusOutcome::Unvalidated { .. }));
}

#[test]
fn test_untrusted_metadata_is_unvalidated() {
    let (director, image) = repositories();
    director.publish("/firmware.bin", FIRMWARE, None);
    image.publish("/firmware.bin", FIRMWARE, None);
    image.mark_untrusted("/firmware.bin");

    let report = validate_consensus(&directed(&["/firmware.bin"]), &director, &image);

    assert!(report.verified_targets().is_empty());
    assert!(matches!(&report.outcomes[0], ConsensusOutcome::Unvalidated { reason, .. } if reason.contains("not trusted")));
}

#[test]
fn test_verified_targets_follow_director_order() {
    let (director, image) = repositories();
    for name in ["/a.bin", "/b.bin", "/c.bin", "/d.bin"] {
        director.publish(name, name.as_bytes(), None);
    }
    for name in ["/d.bin", "/c.bin", "/a.bin"] {
        image.publish(name, name.as_bytes(), None);
    }

    let report = validate_consensus(&directed(&["/d.bin", "/b.bin", "/a.bin", "/c.bin"]), &director, &image);

    let order: Vec<String> = report.verified_targets().into_iter().map(|t| t.filepath).collect();
    assert_eq!(order, vec!["/d.bin", "/a.bin", "/c.bin"]);
    assert_eq!(
        report.outcomes.iter().map(ConsensusOutcome::filepath).collect::<Vec<_>>(),
        vec!["/d.bin", "/b.bin", "/a.bin", "/c.bin"]
    );
}

#[test]
fn test_consensus_is_deterministic_but_not_cached() {
    let (director, image) = repositories();
    director.publish("/firmware.bin", FIRMWARE, None);
    image.publish("/firmware.bin", FIRMWARE, None);
    let list = directed(&["/firmware.bin"]);

    let first = validate_consensus(&list, &director, &image);
    let second = validate_consensus(&list, &director, &image);
    assert_eq!(first, second);

    image.remove_target("/firmware.bin");
    let third = validate_consensus(&list, &director, &image);
    assert!(third.verified_targets().is_empty());
}

#[test]
fn test_unrefreshed_repository_cannot_validate() {
    let director = MemoryRepository::new("director");
    let (_, image) = repositories();
    director.publish("/firmware.bin", FIRMWARE, None);
    image.publish("/firmware.bin", FIRMWARE, None);

    let report = validate_consensus(&directed(&["/firmware.bin"]), &director, &image);
    assert!(report.verified_targets().is_empty());
}

#[test]
fn test_fileinfo_checks_content() {
    let info = FileInfo::from_bytes(FIRMWARE);
    assert!(info.check_content(FIRMWARE).is_ok());
    assert!(info.check_content(b"firmware image for ECU 22222, rev. 9").is_err());
    assert!(info.check_content(b"short").is_err());
}
