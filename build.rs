//! Build script for iptsync
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! reported by `iptsync version`.

fn main() {
    // Packagers can relocate the default rule-file directory
    println!("cargo:rerun-if-env-changed=IPTSYNC_SYSTEM_CONF_DIR");

    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
