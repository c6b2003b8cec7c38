pub mod blkid;
pub mod bootctl;
pub mod chroot;
pub mod cryptsetup;
pub mod dependencies;
pub mod dmsetup;
pub mod files;
pub mod grubenv;
pub mod losetup;
pub mod lsblk;
pub mod lsof;
pub mod mkfs;
pub mod mksquashfs;
pub mod mount;
pub mod path;
pub mod rsync;
pub mod scripts;
pub mod sfdisk;
pub mod tpm2;
pub mod udevadm;
pub mod wipefs;
