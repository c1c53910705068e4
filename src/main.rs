//! The default `kvopbench` binary.

fn main() {
    kvopbench::cmdline();
}
