/// Where the ESP is mounted while the agent manipulates boot artefacts.
pub const ESP_MOUNT_POINT_PATH: &str = "/efi";

/// Fallback boot directory on the ESP, holding the signed shim and loader.
pub const ESP_FALLBACK_DIR: &str = "EFI/BOOT";

/// Name of the fallback loader executable.
pub const FALLBACK_EFI: &str = "BOOTX64.EFI";

/// Default vendor directory under `EFI/` holding per-role boot images.
pub const DEFAULT_VENDOR: &str = "capstan";

/// Top-level loader configuration, relative to the ESP root.
pub const LOADER_CONF_PATH: &str = "loader/loader.conf";

/// Entries directory of the unified variant, relative to the ESP root.
pub const LOADER_ENTRIES_DIR: &str = "loader/entries";

/// Filesystem labels of the partitions the agent owns.
pub const LABEL_ESP: &str = "CAP_ESP";
pub const LABEL_STATE: &str = "CAP_STATE";
pub const LABEL_OEM: &str = "CAP_OEM";
pub const LABEL_PERSISTENT: &str = "CAP_PERSIST";
pub const LABEL_RECOVERY: &str = "CAP_RECOVERY";

/// Filesystem labels stamped on the legacy variant's loopback slot images.
pub const LABEL_ACTIVE: &str = "CAP_ACTIVE";
pub const LABEL_PASSIVE: &str = "CAP_PASSIVE";

/// Directory inside the state and recovery partitions holding slot images.
pub const IMAGES_DIR: &str = "images";

/// Size of a legacy slot image when it cannot be derived from the layout.
pub const DEFAULT_IMAGE_SIZE_MIB: u64 = 3072;

/// Scratch tree under which target partitions are mounted during an action.
pub const TARGET_MOUNT_ROOT: &str = "/run/capstan/target";

/// Directory probed for per-hook executable scripts.
pub const HOOK_SCRIPT_DIR: &str = "/usr/lib/capstan/hooks";

/// Default interpreter for stage commands and hook scripts.
pub const DEFAULT_SCRIPT_INTERPRETER: &str = "/bin/sh";

/// Device-mapper nodes appear under this directory once a LUKS container is
/// opened.
pub const MAPPER_DIR: &str = "/dev/mapper";

/// Size of a partition that will be grown to fill all remaining space.
pub const PARTITION_SIZE_GROW: u64 = 0;

/// Smallest ESP the agent will create, in MiB. Three slot artefact sets plus
/// the fallback loader fit comfortably.
pub const ESP_MIN_SIZE_MIB: u64 = 512;

/// Deadline for the remote attestation exchange.
pub const DEFAULT_ATTESTATION_TIMEOUT_SECS: u64 = 30;

/// `bootctl` must report at least this version before `uki` keys are written
/// or TPM2+PCR keyslots are enrolled.
pub const MIN_BOOT_TOOL_VERSION: u64 = 252;

/// Default TPM NV index used by the local passphrase store.
pub const DEFAULT_TPM_NV_INDEX: &str = "0x1500000";

/// Default sort-key assigned to entries that map to no standard role.
pub const SORT_KEY_OTHER: &str = "0010";

/// Sentinel file relative to the target root; its presence after the
/// pre-install hook aborts the installation.
pub const FAIL_SENTINEL_REL_PATH: &str = "run/capstan/fail-install";
