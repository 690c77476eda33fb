//! Generates libibverbs bindings when the `verbs` feature is enabled.
//! Without it, only the in-process software fabric is built and nothing
//! native is linked.

fn main() {
    // Refuse to compile on non-64-bit platforms.
    if cfg!(not(target_pointer_width = "64")) {
        panic!("`ibecho` currently only supports 64-bit platforms");
    }

    #[cfg(feature = "verbs")]
    verbs::main();
}

#[cfg(feature = "verbs")]
mod verbs {
    use std::env::{self, consts};
    use std::path::{Path, PathBuf};
    use std::process::Command;

    /// Try to link to an existing `MLNX_OFED` installation.
    ///
    /// MLNX_OFED v4.9-x LTS does not register `libibverbs` to `pkg-config`,
    /// so look for it manually. Newer releases are found by `pkg-config`.
    fn link_mlnx_ofed() -> Option<Vec<String>> {
        let output = Command::new("ofed_info").arg("-n").output().ok()?;
        if *output.stdout.first()? != b'4' {
            return None;
        }

        let lib_dir = match env::var("MLNX_OFED_LIB_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => PathBuf::from("/usr/lib"),
        };
        let dylib_name = format!("{}ibverbs{}", consts::DLL_PREFIX, consts::DLL_SUFFIX);
        if !lib_dir.join(dylib_name).exists() && !lib_dir.join("libibverbs.a").exists() {
            return None;
        }

        println!("cargo:rustc-link-search=native={}", lib_dir.display());
        println!("cargo:rustc-link-lib=ibverbs");
        Some(env::var("MLNX_OFED_INCLUDE_DIR").into_iter().collect())
    }

    /// Link to `libibverbs` as registered to `pkg-config` (rdma-core or
    /// MLNX_OFED v5 and later).
    fn link_pkg_config() -> Vec<String> {
        let lib = pkg_config::Config::new()
            .statik(false)
            .probe("libibverbs")
            .unwrap_or_else(|e| panic!("cannot find libibverbs: {}", e));
        lib.include_paths
            .iter()
            .filter_map(|p| p.to_str().map(str::to_owned))
            .collect()
    }

    pub fn main() {
        println!("cargo:rerun-if-changed=src/bindings/verbs.h");
        println!("cargo:rerun-if-env-changed=MLNX_OFED_INCLUDE_DIR");
        println!("cargo:rerun-if-env-changed=MLNX_OFED_LIB_DIR");

        let include_dirs = link_mlnx_ofed().unwrap_or_else(link_pkg_config);
        gen_verb_bindings(include_dirs);
    }

    fn gen_verb_bindings(include_dirs: Vec<String>) {
        let include_args = include_dirs.iter().map(|p| format!("-I{}", p));
        let bindings = bindgen::builder()
            .clang_args(include_args)
            .header("src/bindings/verbs.h")
            .allowlist_function("ibv_get_device_list")
            .allowlist_function("ibv_free_device_list")
            .allowlist_function("ibv_get_device_name")
            .allowlist_function("ibv_open_device")
            .allowlist_function("ibv_close_device")
            .allowlist_function("ibv_alloc_pd")
            .allowlist_function("ibv_dealloc_pd")
            .allowlist_function("ibv_reg_mr")
            .allowlist_function("ibv_dereg_mr")
            .allowlist_function("ibv_create_cq")
            .allowlist_function("ibv_destroy_cq")
            .allowlist_function("ibv_create_qp")
            .allowlist_function("ibv_destroy_qp")
            .allowlist_function("ibv_modify_qp")
            .allowlist_function("ibv_query_gid")
            .allowlist_type("ibv_.*")
            .allowlist_type("verbs_.*")
            .opaque_type("pthread_.*")
            .blocklist_type("in6_addr")
            .blocklist_type("sockaddr.*")
            .blocklist_type("timespec")
            .bitfield_enum("ibv_wc_flags")
            .bitfield_enum("ibv_access_flags")
            .bitfield_enum("ibv_qp_attr_mask")
            .bitfield_enum("ibv_send_flags")
            .constified_enum_module("ibv_mtu")
            .constified_enum_module("ibv_port_state")
            .constified_enum_module("ibv_wc_status")
            .constified_enum_module("ibv_wc_opcode")
            .constified_enum_module("ibv_qp_type")
            .constified_enum_module("ibv_qp_state")
            .constified_enum_module("ibv_mig_state")
            .constified_enum_module("ibv_wr_opcode")
            .derive_copy(true)
            .derive_debug(false)
            .derive_default(true)
            .generate_comments(false)
            .layout_tests(false)
            .prepend_enum_name(false)
            .size_t_is_usize(true)
            .generate()
            .expect("failed to generate bindings");

        let out_dir = env::var_os("OUT_DIR").expect("OUT_DIR is set by cargo");
        let dest = Path::new(&out_dir).join("verbs_bindings.rs");
        bindings
            .write_to_file(dest)
            .expect("failed to write bindings");
    }
}
