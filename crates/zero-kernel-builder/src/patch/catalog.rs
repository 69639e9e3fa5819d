//! Fixed source modification tables for the supported kernel trees.

use crate::build_config::{Base, KernelVersion};

/// Function declarations in one file that need `()` rewritten to `(void)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrototypeFix {
    /// Relative to the kernel tree.
    pub file: &'static str,
    pub signatures: &'static [&'static str],
}

const fn fix(file: &'static str, signatures: &'static [&'static str]) -> PrototypeFix {
    PrototypeFix { file, signatures }
}

const PROTOTYPES_COMMON: &[PrototypeFix] = &[
    fix(
        "drivers/char/diag/diagchar_core.c",
        &["void diag_ws_init()", "void diag_ws_on_notify()", "void diag_ws_release()"],
    ),
    fix(
        "drivers/char/diag/diag_mux.c",
        &["int diag_mux_init()", "void diag_mux_exit()"],
    ),
    fix(
        "drivers/char/diag/diag_memorydevice.c",
        &["void diag_md_open_all()", "void diag_md_close_all()"],
    ),
    fix("drivers/char/diag/diag_dci.c", &["void diag_dci_wakeup_clients()"]),
    fix(
        "drivers/char/diag/diagfwd_bridge.c",
        &["void diagfwd_bridge_exit()", "uint16_t diag_get_remote_device_mask()"],
    ),
    fix(
        "drivers/char/diag/diagfwd_mhi.c",
        &["int diag_mhi_init()", "void diag_mhi_exit()"],
    ),
    fix(
        "drivers/media/platform/msm/camera_v2/common/msm_camera_tz_util.c",
        &["struct qseecom_handle *msm_camera_tz_get_ta_handle()"],
    ),
    fix(
        "drivers/media/platform/msm/vidc/msm_vidc_common.c",
        &["void msm_comm_handle_thermal_event()"],
    ),
    fix(
        "drivers/soc/qcom/msm_bus/msm_bus_rpm_smd.c",
        &["void msm_bus_rpm_set_mt_mask()"],
    ),
    fix(
        "drivers/staging/qca-wifi-host-cmn/hif/src/ce/ce_service.c",
        &["struct ce_ops *ce_services_legacy()"],
    ),
    fix(
        "drivers/staging/qcacld-3.0/core/hdd/src/wlan_hdd_main.c",
        &["hdd_adapter_t *hdd_get_first_valid_adapter()"],
    ),
    fix(
        "drivers/video/fbdev/msm/mdss_mdp.c",
        &["struct irq_info *mdss_intr_line()"],
    ),
    fix(
        "drivers/video/fbdev/msm/mdss_util.c",
        &["struct mdss_util_intf *mdss_get_util_intf()"],
    ),
];

// Not present in 4.14 trees.
const PROTOTYPES_PRE_4_14: &[PrototypeFix] = &[
    fix(
        "drivers/soc/qcom/qdsp6v2/voice_svc.c",
        &["void msm_bus_rpm_set_mt_mask()", "static int voice_svc_dummy_reg()"],
    ),
    fix(
        "drivers/thermal/msm_thermal-dev.c",
        &["int msm_thermal_ioctl_init()", "void msm_thermal_ioctl_cleanup()"],
    ),
];

const PROTOTYPES_PA: &[PrototypeFix] = &[
    fix(
        "drivers/staging/qca-wifi-host-cmn/target_if/core/src/target_if_main.c",
        &["struct target_if_ctx *target_if_get_ctx()"],
    ),
    fix(
        "drivers/staging/qca-wifi-host-cmn/wlan_cfg/wlan_cfg.c",
        &["struct wlan_cfg_dp_soc_ctxt *wlan_cfg_soc_attach()"],
    ),
];

/// Files patched for `-Wstrict-prototypes` under clang 15+, selected by
/// (kernel version in source, base) only.
pub fn strict_prototypes_catalog(kernel_version: KernelVersion, base: Base) -> Vec<PrototypeFix> {
    let mut out = PROTOTYPES_COMMON.to_vec();
    if !kernel_version.is_4_14() {
        out.extend_from_slice(PROTOTYPES_PRE_4_14);
    }
    if base == Base::Pa {
        out.extend_from_slice(PROTOTYPES_PA);
    }
    out
}

/// First clang major version that rejects the old-style prototypes.
pub const STRICT_PROTOTYPES_MIN_CLANG: u32 = 15;

/// Appended to every generated defconfig (Wi-Fi injection and the RTL8812AU driver).
pub const BASELINE_CONFIGS: &[(&str, &str)] = &[
    ("CONFIG_88XXAU", "y"),
    ("CONFIG_MODULE_FORCE_LOAD", "y"),
    ("CONFIG_MODULE_FORCE_UNLOAD", "y"),
    ("CONFIG_CFG80211_WEXT", "y"),
    ("CONFIG_CFG80211_WEXT_EXPORT", "y"),
    ("CONFIG_CONCURRENT_MODE", "n"),
    ("CONFIG_MAC80211", "y"),
    ("CONFIG_RTL8187", "y"),
    ("CONFIG_RTLWIFI", "y"),
];

pub const KSU_CONFIGS: &[(&str, &str)] = &[
    ("CONFIG_KSU", "y"),
    ("CONFIG_MODULES", "y"),
    ("CONFIG_MODULE_UNLOAD", "y"),
    ("CONFIG_MODVERSIONS", "y"),
    ("CONFIG_DIAG_CHAR", "y"),
    ("CONFIG_KPROBES", "y"),
    ("CONFIG_HAVE_KPROBES", "y"),
    ("CONFIG_KPROBE_EVENTS", "y"),
];

pub const KERNELSU_COMPAT_PATCH: &str = "kernelsu-compat.patch";
pub const QCACLD_PA_PATCH: &str = "qcacld_pa.patch";

/// Patch files in the modification catalog applied by dedicated stages, not in bulk.
pub const EXCLUDED_PATCHES: &[&str] = &[KERNELSU_COMPAT_PATCH, QCACLD_PA_PATCH];

pub const MAC80211_FILES: &[&str] = &["net/mac80211/tx.c", "net/mac80211/mlme.c"];
pub const MAC80211_BAND_FIX: (&str, &str) = ("case IEEE80211_BAND_60GHZ:", "case NL80211_BAND_60GHZ:");

pub const IPA_FILE: &str = "drivers/platform/msm/ipa/ipa_v3/ipa.c";
pub const IPA_HEADER_FIX: (&str, &str) = ("\tu8 header[128] = { 0 };", "\tu8 header[512] = { 0 };");

/// Literal edits for the RTL8812AU v5.6.4.2 driver, keyed by file relative to the driver root.
pub const RTL8812AU_SUBSTITUTIONS: &[(&str, &[(&str, &str)])] = &[
    (
        "Makefile",
        &[
            (
                "#EXTRA_CFLAGS += -Wno-parentheses-equality",
                "EXTRA_CFLAGS += -Wno-parentheses-equality",
            ),
            (
                "#EXTRA_CFLAGS += -Wno-pointer-bool-conversion",
                "EXTRA_CFLAGS += -Wno-pointer-bool-conversion\nEXTRA_CFLAGS += -Wno-pointer-bool-conversion\nEXTRA_CFLAGS += -Wno-pragma-pack\nEXTRA_CFLAGS += -Wno-unused-variable",
            ),
            (
                "$(MAKE) ARCH=$(ARCH) CROSS_COMPILE=$(CROSS_COMPILE) -C $(KSRC) M=$(shell pwd)  modules",
                "$(MAKE) ARCH=$(ARCH) SUBARCH=$(ARCH) REAL_CC=${CC_DIR}/clang CLANG_TRIPLE=aarch64-linux-gnu- CROSS_COMPILE=$(CROSS_COMPILE) -C $(KSRC) M=$(shell pwd) O=\"$(KBUILD_OUTPUT)\" modules",
            ),
            ("CONFIG_PLATFORM_I386_PC = y", "CONFIG_PLATFORM_I386_PC = n"),
            (
                "CONFIG_PLATFORM_ANDROID_ARM64 = n",
                "CONFIG_PLATFORM_ANDROID_ARM64 = y\nCONFIG_CONCURRENT_MODE = n",
            ),
        ],
    ),
    (
        "os_dep/linux/ioctl_cfg80211.h",
        &[(
            "#if (LINUX_VERSION_CODE >= KERNEL_VERSION(2, 6, 26)) && (LINUX_VERSION_CODE < KERNEL_VERSION(4, 7, 0))",
            "#if (LINUX_VERSION_CODE >= KERNEL_VERSION(2, 6, 26)) && (LINUX_VERSION_CODE < KERNEL_VERSION(4, 4, 0))",
        )],
    ),
    (
        "os_dep/linux/ioctl_cfg80211.c",
        &[
            (
                "sinfo->bss_param.flags |= STATION_INFO_BSS_PARAM_SHORT_PREAMBLE;",
                "sinfo->bss_param.flags |= NL80211_STA_BSS_PARAM_SHORT_PREAMBLE;",
            ),
            (
                "sinfo->bss_param.flags |= STATION_INFO_BSS_PARAM_SHORT_SLOT_TIME;",
                "sinfo->bss_param.flags |= NL80211_STA_BSS_PARAM_SHORT_SLOT_TIME;",
            ),
            (
                "sinfo->bss_param.flags |= STATION_INFO_BSS_PARAM_CTS_PROT;",
                "sinfo->bss_param.flags |= NL80211_STA_BSS_PARAM_CTS_PROT;",
            ),
            (
                "sinfo->bss_param.flags |= STATION_INFO_BSS_PARAM_DTIM_PERIOD;",
                "sinfo->bss_param.flags |= NL80211_STA_BSS_PARAM_DTIM_PERIOD;",
            ),
        ],
    ),
];

pub const RTL8812AU_DEST: &str = "drivers/net/wireless/realtek/rtl8812au";
pub const REALTEK_MAKEFILE: &str = "drivers/net/wireless/realtek/Makefile";
pub const REALTEK_MAKEFILE_LINE: &str = "obj-$(CONFIG_88XXAU)\t\t+= rtl8812au/\n";
pub const WIRELESS_KCONFIG: &str = "drivers/net/wireless/Kconfig";
pub const RTL8812AU_KCONFIG_SOURCE: &str = "source \"drivers/net/wireless/realtek/rtl8812au/Kconfig\"";

pub const KSU_LINK: &str = "drivers/kernelsu";
pub const KSU_MAKEFILE: &str = "drivers/Makefile";
pub const KSU_MAKEFILE_LINE: &str = "obj-$(CONFIG_KSU)\t\t+= kernelsu/\n";
pub const KSU_KCONFIG: &str = "drivers/Kconfig";
pub const KSU_KCONFIG_SOURCE: &str = "source \"drivers/kernelsu/Kconfig\"";
