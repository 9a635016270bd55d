// Package module - install/remove packages

use super::PackageManager;
use crate::executor::context::shell_quote;

/// Non-interactive install or remove command for `packages`
pub fn package_command(manager: PackageManager, install: bool, packages: &[String]) -> String {
    let names = packages
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ");
    if install {
        manager.install_cmd(&names)
    } else {
        manager.remove_cmd(&names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_packages_in_one_command() {
        let packages = vec!["nginx".to_string(), "curl".to_string()];
        assert_eq!(
            package_command(PackageManager::Apt, true, &packages),
            "DEBIAN_FRONTEND=noninteractive apt-get install -y 'nginx' 'curl'"
        );
        assert_eq!(
            package_command(PackageManager::Pacman, false, &packages),
            "pacman -R --noconfirm 'nginx' 'curl'"
        );
    }

    #[test]
    fn test_package_names_cannot_inject_commands() {
        let packages = vec!["vim; rm -rf /tmp/x".to_string()];
        assert_eq!(
            package_command(PackageManager::Apk, true, &packages),
            "apk add 'vim; rm -rf /tmp/x'"
        );
    }
}
