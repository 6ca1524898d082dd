use super::*;

#[test]
fn test_exit_status_byte_passes_child_codes_through() {
    assert_eq!(exit_status_byte(0), 0);
    assert_eq!(exit_status_byte(7), 7);
    assert_eq!(exit_status_byte(137), 137);
    assert_eq!(exit_status_byte(255), 255);
}

#[test]
fn test_exit_status_byte_rejects_out_of_range_codes() {
    assert_eq!(exit_status_byte(-1), 1);
    assert_eq!(exit_status_byte(256), 1);
}

#[test]
fn test_setup_failures_share_the_spawn_exit_code() {
    assert_eq!(EXIT_SETUP_FAILED, portier::bootstrap::EXIT_SPAWN_FAILED);
}
