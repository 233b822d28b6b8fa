pub mod afc;
pub mod debugserver;
pub mod installation_proxy;
pub mod lockdown;
pub mod mobile_image_mounter;
