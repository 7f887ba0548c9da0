//! Compile-time defaults, generated by build.rs (see `FIO_CONFIG_RS`)

include!(concat!(env!("OUT_DIR"), "/fio_merged_config.rs"));
