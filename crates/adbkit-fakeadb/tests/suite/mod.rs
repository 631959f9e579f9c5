mod inventory;
mod jdwp_session;
mod services;
mod track_jdwp;
