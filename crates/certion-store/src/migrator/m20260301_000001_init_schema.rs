//! Initial schema: routing entries, firewall rules/config, access requests

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // ============================================================
        // 1. Routing entries
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(RoutingEntries::Table)
                    .if_not_exists()
                    .col(string_len(RoutingEntries::Subdomain, 63).primary_key())
                    .col(string_len(RoutingEntries::ProjectId, 255).not_null())
                    .col(string_len(RoutingEntries::AgentId, 255).not_null())
                    .col(integer(RoutingEntries::LocalPort).not_null())
                    .col(
                        timestamp_with_time_zone(RoutingEntries::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_routing_entries_agent_id")
                    .table(RoutingEntries::Table)
                    .col(RoutingEntries::AgentId)
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 2. Firewall rules
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(FirewallRules::Table)
                    .if_not_exists()
                    .col(pk_auto(FirewallRules::Id))
                    .col(string_len(FirewallRules::ProjectId, 255).not_null())
                    .col(string_len(FirewallRules::RuleType, 16).not_null())
                    .col(text(FirewallRules::Value).not_null())
                    .col(text_null(FirewallRules::Description))
                    .col(
                        timestamp_with_time_zone(FirewallRules::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_firewall_rules_unique")
                    .table(FirewallRules::Table)
                    .col(FirewallRules::ProjectId)
                    .col(FirewallRules::RuleType)
                    .col(FirewallRules::Value)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 3. Firewall configuration
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(FirewallConfigs::Table)
                    .if_not_exists()
                    .col(string_len(FirewallConfigs::ProjectId, 255).primary_key())
                    .col(boolean(FirewallConfigs::Enabled).not_null().default(true))
                    .col(
                        integer(FirewallConfigs::RateLimitPerMinute)
                            .not_null()
                            .default(100),
                    )
                    .col(
                        boolean(FirewallConfigs::AutoBlockSuspicious)
                            .not_null()
                            .default(false),
                    )
                    .col(text(FirewallConfigs::WhitelistIps).not_null())
                    .col(
                        timestamp_with_time_zone(FirewallConfigs::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 4. Access requests
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(FirewallAccessRequests::Table)
                    .if_not_exists()
                    .col(pk_auto(FirewallAccessRequests::Id))
                    .col(string_len(FirewallAccessRequests::ProjectId, 255).not_null())
                    .col(string_len(FirewallAccessRequests::IpAddress, 45).not_null())
                    .col(string_len(FirewallAccessRequests::Method, 16).not_null())
                    .col(text(FirewallAccessRequests::Path).not_null())
                    .col(integer_null(FirewallAccessRequests::RuleId))
                    .col(text(FirewallAccessRequests::BlockReason).not_null())
                    .col(
                        string_len(FirewallAccessRequests::Status, 16)
                            .not_null()
                            .default("pending"),
                    )
                    .col(timestamp_with_time_zone_null(
                        FirewallAccessRequests::ApprovedUntil,
                    ))
                    .col(
                        timestamp_with_time_zone(FirewallAccessRequests::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(FirewallAccessRequests::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_access_requests_project_status")
                    .table(FirewallAccessRequests::Table)
                    .col(FirewallAccessRequests::ProjectId)
                    .col(FirewallAccessRequests::Status)
                    .to_owned(),
            )
            .await?;

        // At most one pending record per (project, ip, method, path)
        manager
            .get_connection()
            .execute_unprepared(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_access_requests_one_pending \
                 ON firewall_access_requests (project_id, ip_address, method, path) \
                 WHERE status = 'pending'",
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(
                Table::drop()
                    .table(FirewallAccessRequests::Table)
                    .if_exists()
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(
                Table::drop()
                    .table(FirewallConfigs::Table)
                    .if_exists()
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(
                Table::drop()
                    .table(FirewallRules::Table)
                    .if_exists()
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(
                Table::drop()
                    .table(RoutingEntries::Table)
                    .if_exists()
                    .to_owned(),
            )
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum RoutingEntries {
    Table,
    Subdomain,
    ProjectId,
    AgentId,
    LocalPort,
    CreatedAt,
}

#[derive(DeriveIden)]
enum FirewallRules {
    Table,
    Id,
    ProjectId,
    RuleType,
    Value,
    Description,
    CreatedAt,
}

#[derive(DeriveIden)]
enum FirewallConfigs {
    Table,
    ProjectId,
    Enabled,
    RateLimitPerMinute,
    AutoBlockSuspicious,
    WhitelistIps,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum FirewallAccessRequests {
    Table,
    Id,
    ProjectId,
    IpAddress,
    Method,
    Path,
    RuleId,
    BlockReason,
    Status,
    ApprovedUntil,
    CreatedAt,
    UpdatedAt,
}
