mod day;
mod entry;
mod helpers;
mod key;
mod log;
mod sync;

pub(crate) use day::{cmd_companion_show, cmd_month, cmd_show};
pub(crate) use entry::{cmd_entry_move, cmd_entry_remove};
pub(crate) use key::cmd_key_show;
pub(crate) use log::{cmd_basal_set, cmd_dose_add, cmd_glucose_add, cmd_notes_set};
pub(crate) use sync::{
    cmd_recover, cmd_sync_disable, cmd_sync_enable, cmd_sync_push, cmd_sync_status,
};
