use std::fs;

use crate::error::UpdateError;
use crate::orchestrator::{DownloadOutcome, FirmwareOutcome, UpdateCycle};
use crate::repository::{MemoryRepository, Mirror};
use crate::types::{FileInfo, TargetInfo};

const FIRMWARE_NAME: &str = "secondary_firmware.txt";
const GOOD: &[u8] = b"This is the firmware for ECU 22222, v2";
const EVIL: &[u8] = b"This is malicious firmware, do not run";

fn repositories() -> (MemoryRepository, MemoryRepository) {
    (MemoryRepository::new("director"), MemoryRepository::new("imagerepo"))
}

#[test]
fn test_cycle_downloads_and_installs_firmware() {
    let dir = tempfile::tempdir().unwrap();
    let targets_dir = dir.path().join("targets");
    let (director, image) = repositories();
    let target = director.publish("/secondary_firmware.txt", GOOD, None);
    image.publish("/secondary_firmware.txt", GOOD, None);

    let report = UpdateCycle::new(&director, &image, &targets_dir, FIRMWARE_NAME)
        .run()
        .unwrap();

    assert_eq!(report.directed, vec![target.clone()]);
    assert_eq!(report.firmware, FirmwareOutcome::Installed(target));
    assert!(!report.no_updates_required());
    assert_eq!(fs::read(targets_dir.join(FIRMWARE_NAME)).unwrap(), GOOD);
}

#[test]
fn test_cycle_with_no_directed_targets_is_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let (director, image) = repositories();
    image.publish("/secondary_firmware.txt", GOOD, None);

    let report = UpdateCycle::new(&director, &image, dir.path().join("targets"), FIRMWARE_NAME)
        .run()
        .unwrap();

    assert!(report.no_updates_required());
    assert!(report.downloads.is_empty());
    assert_eq!(report.firmware, FirmwareOutcome::NotDirected);
}

#[test]
fn test_untrustworthy_firmware_is_rejected_not_installed() {
    let dir = tempfile::tempdir().unwrap();
    let targets_dir = dir.path().join("targets");
    let (director, image) = repositories();

    let target = TargetInfo::new("/secondary_firmware.txt", FileInfo::from_bytes(GOOD));
    director.add_target(target.clone());
    image.add_target(target);
    director.add_mirror(Mirror::new("director-mirror").with_file("/secondary_firmware.txt", EVIL));
    image.add_mirror(Mirror::new("image-mirror-1").with_file("/secondary_firmware.txt", EVIL));
    image.add_mirror(Mirror::new("image-mirror-2"));

    // A leftover from an earlier cycle must not survive a failed download.
    fs::create_dir_all(&targets_dir).unwrap();
    fs::write(targets_dir.join(FIRMWARE_NAME), b"stale").unwrap();

    let report = UpdateCycle::new(&director, &image, &targets_dir, FIRMWARE_NAME)
        .run()
        .unwrap();

    assert_eq!(report.verified_targets().len(), 1);
    match &report.firmware {
        FirmwareOutcome::Rejected { filepath, mirror_errors } => {
            assert_eq!(filepath, "/secondary_firmware.txt");
            assert!(mirror_errors.contains_key("imagerepo/image-mirror-1"));
            assert!(mirror_errors.contains_key("imagerepo/image-mirror-2"));
            assert!(mirror_errors.contains_key("director/director-mirror"));
        }
        other => panic!("expected rejected firmware, got {other:?}"),
    }
    assert!(!targets_dir.join(FIRMWARE_NAME).exists());
}

#[test]
fn test_download_falls_back_to_director_mirror() {
    let dir = tempfile::tempdir().unwrap();
    let targets_dir = dir.path().join("targets");
    let (director, image) = repositories();

    let target = director.publish("/secondary_firmware.txt", GOOD, None);
    image.add_target(target.clone());
    image.add_mirror(Mirror::new("image-mirror").with_file("/secondary_firmware.txt", EVIL));

    let report = UpdateCycle::new(&director, &image, &targets_dir, FIRMWARE_NAME)
        .run()
        .unwrap();

    assert_eq!(report.firmware, FirmwareOutcome::Installed(target));
    assert_eq!(fs::read(targets_dir.join(FIRMWARE_NAME)).unwrap(), GOOD);
}

#[test]
fn test_failed_download_does_not_stop_other_targets() {
    let dir = tempfile::tempdir().unwrap();
    let targets_dir = dir.path().join("targets");
    let (director, image) = repositories();

    let broken = TargetInfo::new("/maps/region.bin", FileInfo::from_bytes(b"map data"));
    director.add_target(broken.clone());
    image.add_target(broken);
    let firmware = director.publish("/secondary_firmware.txt", GOOD, None);
    image.publish("/secondary_firmware.txt", GOOD, None);

    let report = UpdateCycle::new(&director, &image, &targets_dir, FIRMWARE_NAME)
        .run()
        .unwrap();

    assert_eq!(report.downloads.len(), 2);
    assert!(matches!(&report.downloads[0], DownloadOutcome::Failed { filepath, .. } if filepath == "/maps/region.bin"));
    assert!(matches!(&report.downloads[1], DownloadOutcome::Downloaded { .. }));
    assert_eq!(report.firmware, FirmwareOutcome::Installed(firmware));
}

#[test]
fn test_escaping_target_path_aborts_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let targets_dir = dir.path().join("client").join("targets");
    let (director, image) = repositories();
    director.publish("/../../escaped.txt", EVIL, None);
    image.publish("/../../escaped.txt", EVIL, None);

    let err = UpdateCycle::new(&director, &image, &targets_dir, FIRMWARE_NAME)
        .run()
        .unwrap_err();

    assert!(matches!(err, UpdateError::PathEscape { .. }));
    assert!(!dir.path().join("escaped.txt").exists());
}

#[test]
fn test_nested_target_lands_inside_jail() {
    let dir = tempfile::tempdir().unwrap();
    let targets_dir = dir.path().join("targets");
    let (director, image) = repositories();
    director.publish("/nested/dir/file.bin", GOOD, None);
    image.publish("/nested/dir/file.bin", GOOD, None);

    let report = UpdateCycle::new(&director, &image, &targets_dir, FIRMWARE_NAME)
        .run()
        .unwrap();

    match &report.downloads[0] {
        DownloadOutcome::Downloaded { path, .. } => {
            assert!(path.starts_with(&targets_dir));
            assert_eq!(fs::read(path).unwrap(), GOOD);
        }
        other => panic!("expected a download, got {other:?}"),
    }
    assert_eq!(report.firmware, FirmwareOutcome::NotDirected);
}
