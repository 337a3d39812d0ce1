// SPDX-FileCopyrightText: Copyright © 2025 AB Recovery Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Kernel image location
//!
//! Given a kernel release and the boot directory listing, find the live
//! kernel image and, when one exists, the matching initial ramdisk. The
//! initrd naming zoo is probed with an ordered template list; a kernel
//! without an initrd is acceptable.

use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::Error;

/// The bootable pieces of one kernel release
#[derive(Debug, Clone, PartialEq)]
pub struct KernelFiles {
    /// vmlinuz/vmlinux path
    pub linux: PathBuf,

    /// Initial ramdisk, absent on arches that boot without one
    pub initrd: Option<PathBuf>,
}

const INITRD_TEMPLATES: [&str; 14] = [
    "initrd.img-${version}",
    "initrd-${version}.img",
    "initrd-${version}.gz",
    "initrd-${version}",
    "initramfs-${version}.img",
    "initrd.img-${altVersion}",
    "initrd-${altVersion}.img",
    "initrd-${altVersion}.gz",
    "initrd-${altVersion}",
    "initramfs-${altVersion}.img",
    "initramfs-genkernel-${version}",
    "initramfs-genkernel-${altVersion}",
    "initramfs-genkernel-${genKernelArch}-${version}",
    "initramfs-genkernel-${genKernelArch}-${altVersion}",
];

/// Genkernel arch family for a `uname -m` machine string
fn genkernel_arch(machine: &str) -> &str {
    match machine {
        "i386" | "i686" => "x86",
        "mips" | "mips64" | "mipsel" | "mips64el" => "mips",
        _ if machine.starts_with("arm") => "arm",
        _ => machine,
    }
}

/// Locate kernel files among the boot directory `files` listing.
///
/// x86 machines never carry a `vmlinux-` image, so the prefix list is
/// machine specific and probed in order.
pub fn locate(release: &str, machine: &str, boot_dir: &Path, files: &[String]) -> Result<KernelFiles, Error> {
    let prefixes: &[&str] = match machine {
        "i386" | "i686" | "x86_64" => &["vmlinuz-", "kernel-"],
        _ => &["vmlinuz-", "vmlinux-", "kernel-"],
    };

    let linux = prefixes
        .iter()
        .map(|prefix| format!("{prefix}{release}"))
        .find(|name| files.iter().any(|f| f == name))
        .map(|name| boot_dir.join(name))
        .ok_or_else(|| Error::KernelNotFound(release.to_string()))?;

    let alt_version = release.strip_suffix(".old").unwrap_or(release);
    let gen_arch = genkernel_arch(machine);
    let initrd = INITRD_TEMPLATES
        .iter()
        .map(|template| {
            template
                .replace("${version}", release)
                .replace("${altVersion}", alt_version)
                .replace("${genKernelArch}", gen_arch)
        })
        .find(|name| files.iter().any(|f| f == name))
        .map(|name| boot_dir.join(name));

    Ok(KernelFiles { linux, initrd })
}

/// Locate kernel files by listing the boot directory
pub fn find_kernel_files(release: &str, machine: &str, boot_dir: &Path) -> Result<KernelFiles, Error> {
    let mut files = Vec::new();
    for entry in fs::read_dir(boot_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        files.push(entry.file_name().to_string_lossy().into_owned());
    }
    locate(release, machine, boot_dir, &files)
}

/// Extract the kernel release from the `BOOT_IMAGE=` boot option.
///
/// When present this names the actually-booted image, which wins over the
/// running kernel's `uname -r`. Returns `None` when the token is missing
/// or the basename carries none of the known image prefixes.
pub fn release_from_boot_options(options: &str) -> Option<String> {
    let boot_img = options
        .split(' ')
        .find_map(|part| part.strip_prefix("BOOT_IMAGE="))?
        .trim();
    if boot_img.is_empty() {
        return None;
    }
    let basename = Path::new(boot_img).file_name()?.to_string_lossy();
    for prefix in ["vmlinuz-", "vmlinux-", "kernel-"] {
        if let Some(release) = basename.strip_prefix(prefix) {
            return Some(release.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn x86_with_initrd() {
        let files = names(&[
            "config-4.19.0-6-amd64",
            "initrd.img-4.19.0-6-amd64",
            "System.map-4.19.0-6-amd64",
            "vmlinuz-4.19.0-6-amd64",
        ]);
        let found = locate("4.19.0-6-amd64", "x86_64", Path::new("/boot"), &files).unwrap();
        assert_eq!(found.linux, PathBuf::from("/boot/vmlinuz-4.19.0-6-amd64"));
        assert_eq!(found.initrd, Some(PathBuf::from("/boot/initrd.img-4.19.0-6-amd64")));
    }

    #[test]
    fn arm_picks_matching_initrd() {
        let files = names(&[
            "config-4.19.0-arm64-desktop",
            "initrd.img-4.19.0-arm64-desktop",
            "initrd.img-4.19.34-1deepin-generic",
            "dtbo.img",
            "System.map-4.19.0-arm64-desktop",
            "vmlinuz-4.19.0-arm64-desktop",
        ]);
        let found = locate("4.19.0-arm64-desktop", "aarch64", Path::new("/boot"), &files).unwrap();
        assert_eq!(found.linux, PathBuf::from("/boot/vmlinuz-4.19.0-arm64-desktop"));
        assert_eq!(
            found.initrd,
            Some(PathBuf::from("/boot/initrd.img-4.19.0-arm64-desktop"))
        );
    }

    #[test]
    fn missing_initrd_is_not_fatal() {
        let files = names(&[
            "config-4.19.0-arm64-desktop",
            "dtbo.img",
            "System.map-4.19.0-arm64-desktop",
            "vmlinuz-4.19.0-arm64-desktop",
        ]);
        let found = locate("4.19.0-arm64-desktop", "aarch64", Path::new("/boot"), &files).unwrap();
        assert_eq!(found.linux, PathBuf::from("/boot/vmlinuz-4.19.0-arm64-desktop"));
        assert_eq!(found.initrd, None);
    }

    #[test]
    fn missing_linux_is_fatal() {
        let files = names(&["config-5.10.0", "initrd.img-5.10.0"]);
        let err = locate("5.10.0", "x86_64", Path::new("/boot"), &files).unwrap_err();
        assert!(matches!(err, Error::KernelNotFound(release) if release == "5.10.0"));
    }

    #[test]
    fn x86_ignores_vmlinux_prefix() {
        let files = names(&["vmlinux-5.10.0", "kernel-5.10.0"]);
        let found = locate("5.10.0", "x86_64", Path::new("/boot"), &files).unwrap();
        assert_eq!(found.linux, PathBuf::from("/boot/kernel-5.10.0"));
    }

    #[test]
    fn first_prefix_hit_wins() {
        let files = names(&["vmlinuz-5.10.0", "kernel-5.10.0"]);
        let found = locate("5.10.0", "x86_64", Path::new("/boot"), &files).unwrap();
        assert_eq!(found.linux, PathBuf::from("/boot/vmlinuz-5.10.0"));
    }

    #[test]
    fn release_from_cmdline() {
        let release = release_from_boot_options(
            "BOOT_IMAGE=/boot/vmlinuz-4.19.0-6-amd64 root=UUID=f18109bb-57ab-4b0f-8bae-a000e59e720a ro splash quiet DEEPIN_GFXMODE=0,1920x1080",
        );
        assert_eq!(release.as_deref(), Some("4.19.0-6-amd64"));

        // token not in first position
        let release = release_from_boot_options(
            "root=UUID=f18109bb-57ab-4b0f-8bae-a000e59e720a ro BOOT_IMAGE=/boot/vmlinuz-4.19.0-6-amd64 splash quiet",
        );
        assert_eq!(release.as_deref(), Some("4.19.0-6-amd64"));

        let release = release_from_boot_options(
            "BOOT_IMAGE=/vmlinuz-4.19.0-arm64-desktop root=UUID=f436eb5f-f471-42d9-b750-49987284e4f5 ro quiet loglevel=0 DEEPIN_GFXMODE=",
        );
        assert_eq!(release.as_deref(), Some("4.19.0-arm64-desktop"));
    }

    #[test]
    fn release_absent_from_cmdline() {
        assert_eq!(release_from_boot_options("root=/dev/sda1 ro quiet"), None);
        assert_eq!(release_from_boot_options("BOOT_IMAGE=/boot/weird-image ro"), None);
    }
}
