//! Default values for `misc`/`main` config keys (spec.md §6.2).

pub(super) fn default_workers() -> usize {
    1
}

pub(super) fn default_task_stack_size() -> usize {
    16384
}

pub(super) fn default_udp_recv_buffer_size() -> usize {
    1_048_576
}

pub(super) fn default_connect_timeout_ms() -> u64 {
    5000
}

pub(super) fn default_read_write_timeout_ms() -> u64 {
    60_000
}

pub(super) fn default_limit_nofile() -> u64 {
    65535
}
