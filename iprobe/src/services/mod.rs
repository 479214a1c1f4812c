pub mod crashreportcopymobile;
pub mod diagnostics_relay;
pub mod dvt;
pub mod house_arrest;
pub mod installation_proxy;
pub mod lockdown;
pub mod mobile_image_mounter;
pub mod pcapd;
pub mod screenshotr;
pub mod simulate_location;
pub mod springboardservices;
pub mod syslog_relay;
